//! A BitTorrent engine for the protocol V1.
//!
//! This crate downloads and seeds many torrents at the same time: it talks
//! the peer wire protocol with the encrypted handshake and the metadata
//! extension, picks pieces rarest-first, verifies them, and writes them to
//! disk. It is the library behind `brisad`, but any program can drive it.
//!
//! Everything runs as tokio tasks that talk with messages. The [engine] owns
//! the torrents and the disk, and each torrent owns its peers. A program
//! only holds an [`engine::EngineHandle`], and listens to the
//! [`engine::EngineEvent`]s that it broadcasts.
//!
//! # Example
//!
//! ```no_run
//! use brisa::{config::Config, engine::Engine};
//!
//! # async fn f() -> Result<(), brisa::error::Error> {
//! let engine = Engine::start(Config::default()).await?;
//! let mut events = engine.subscribe();
//!
//! let id = engine
//!     .add_magnet("magnet:?xt=urn:btih:...", None)
//!     .await?;
//!
//! // peers come from trackers, DHT, or anywhere else.
//! engine.add_peers(id, vec!["1.2.3.4:51413".parse().unwrap()]).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod counter;
pub mod disk;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod ip_filter;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod proxy;
pub mod rate_limiter;
pub mod resume;
pub mod scheduler;
pub mod tcp_wire;
pub mod torrent;
pub mod utils;
