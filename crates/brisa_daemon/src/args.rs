use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[clap(name = "Brisa Daemon")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Accept peer connections on this address.
    #[clap(short, long)]
    pub listen: Option<SocketAddr>,

    /// The directory in which torrents will be downloaded.
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Add a torrent using its magnet link, wrapped in quotes.
    #[clap(short, long)]
    pub magnet: Vec<String>,

    /// Add a torrent from a `.torrent` file.
    #[clap(short, long)]
    pub torrent: Vec<PathBuf>,

    /// Address of a peer to connect to, given to every torrent.
    #[clap(short, long)]
    pub peer: Vec<SocketAddr>,

    /// Upload limit in KiB/s, 0 or less is unlimited.
    #[clap(long)]
    pub upload_limit: Option<i64>,

    /// Download limit in KiB/s, 0 or less is unlimited.
    #[clap(long)]
    pub download_limit: Option<i64>,

    /// `disabled`, `enabled` or `required`.
    #[clap(short, long)]
    pub encryption: Option<String>,

    #[clap(long)]
    pub no_dht: bool,

    /// Do not identify the client to peers, and refuse inbound connections.
    #[clap(long)]
    pub anonymous: bool,

    /// Block an IP address, can be given many times.
    #[clap(long)]
    pub block_ip: Vec<String>,

    /// `trace`, `debug`, `info`, `warn` or `error`.
    #[clap(long, default_value = "info")]
    pub log_level: String,

    /// If the program should quit after all torrents are fully downloaded.
    #[clap(short, long)]
    pub quit_after_complete: bool,
}
