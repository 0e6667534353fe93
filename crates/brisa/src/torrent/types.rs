use std::{fmt::Display, net::SocketAddr, ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};
use tokio::sync::oneshot;

use crate::{
    bitfield::Bitfield,
    extensions::core::{Block, BlockInfo},
    peer::{InboundPeer, PeerCtx, PeerId},
};

/// Torrents are identified by their info hash.
pub type TorrentId = InfoHash;

#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable, PartialOrd,
    Ord,
)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn random() -> Self {
        InfoHash(rand::random())
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;
    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("The infohash must have exactly 20 bytes");
        }
        let mut buff = [0u8; 20];
        buff[..20].copy_from_slice(&value[..20]);
        Ok(InfoHash(buff))
    }
}

impl std::str::FromStr for InfoHash {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buff = hex::decode(s).map_err(|_| "The infohash is not hex")?;
        InfoHash::try_from(buff)
    }
}

/// Lifecycle of a torrent session.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum TorrentStatus {
    /// Magnet torrents before their info dict is assembled.
    DownloadingMetadata,
    /// Hashing the files that are already on disk.
    #[default]
    Checking,
    Downloading,
    Seeding,
    Paused,
    /// An unrecoverable disk error, the session is inactive.
    Error,
    /// Terminal state.
    Removed,
}

impl TorrentStatus {
    /// If the session transfers data in this status.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::DownloadingMetadata
                | Self::Checking
                | Self::Downloading
                | Self::Seeding
        )
    }
}

impl From<TorrentStatus> for &str {
    fn from(val: TorrentStatus) -> Self {
        use TorrentStatus::*;
        match val {
            DownloadingMetadata => "Downloading metadata",
            Checking => "Checking",
            Downloading => "Downloading",
            Seeding => "Seeding",
            Paused => "Paused",
            Error => "Error",
            Removed => "Removed",
        }
    }
}

impl Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: &str = (*self).into();
        f.write_str(s)
    }
}

/// Immutable view of a torrent, sent to the consumers of the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentSnapshot {
    pub id: TorrentId,
    pub name: String,
    pub status: TorrentStatus,
    /// Verified bytes over the size of the torrent, from 0 to 1.
    pub progress: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub size: u64,
    /// Connected peers that have every piece.
    pub seeds: usize,
    /// Connected peers that are not seeds.
    pub peers: usize,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// Addresses received in `port` messages.
    pub dht_nodes: usize,
    /// Every piece is verified, whatever the status is.
    pub completed: bool,
}

impl TorrentSnapshot {
    /// A torrent that is not complete and still has data to transfer, even
    /// if it is paused.
    pub fn is_active(&self) -> bool {
        !self.completed && (self.download_rate > 0 || self.progress < 1.0)
    }
}

/// Messages sent by the disk to a torrent.
#[derive(Debug)]
pub enum DiskEvent {
    /// The piece was hashed from memory, matched, and was flushed.
    PieceVerified(usize),
    /// The piece was discarded.
    PieceHashMismatch(usize),
    /// Writing or reading files failed.
    Error(String),
}

/// Messages used to control the torrent or to update its state.
#[derive(Debug)]
pub enum TorrentMsg {
    /// Candidate addresses of peers to connect to.
    AddPeers(Vec<SocketAddr>),

    /// A peer connected to us and sent a handshake with our info hash.
    IncomingPeer(Box<InboundPeer>),

    /// An outbound connection could not be established.
    PeerConnectFailed(SocketAddr),

    /// The peer finished the handshake and its event loop is running.
    PeerConnected(Arc<PeerCtx>),

    /// The event loop of the peer returned. The address tells apart two
    /// connections of the same peer id.
    PeerDisconnected(PeerId, SocketAddr),

    /// The first message after the handshake, or the bitfield built from
    /// have-all.
    PeerBitfield(PeerId, Bitfield),

    PeerHave(PeerId, usize),

    /// The peer became interested, it is unchoked right away if a slot is
    /// free.
    PeerInterested(PeerId),

    /// Ask the scheduler for up to `qnt` blocks to request from this peer.
    RequestBlocks {
        peer_id: PeerId,
        qnt: usize,
        recipient: oneshot::Sender<Vec<BlockInfo>>,
    },

    /// A requested block arrived.
    BlockReceived(PeerId, Block),

    /// Requests that were not answered in time, or were choked away, and
    /// can be given to other peers.
    ReleaseBlocks(PeerId, Vec<BlockInfo>),

    /// The peer advertised the size of the info dict on its extended
    /// handshake.
    MetadataSize(PeerId, usize),

    /// Ask which metadata piece to request next from this peer.
    RequestMetadataPiece(PeerId, oneshot::Sender<Option<u32>>),

    /// A piece of the info dict, sent by a peer.
    MetadataPiece(PeerId, u32, Vec<u8>),

    /// The peer refused to send a piece of the info dict.
    MetadataReject(PeerId, u32),

    /// The peer sent a `port` message.
    DhtPort(SocketAddr),

    /// Disconnect every peer with this IP.
    BlockIp(std::net::IpAddr),

    GetSnapshot(oneshot::Sender<TorrentSnapshot>),

    /// Suspend all peer I/O.
    Pause,

    Resume,

    /// Stop the session, optionally deleting the files.
    Remove { delete_files: bool, recipient: oneshot::Sender<()> },

    /// The engine is shutting down, persist the resume data and quit.
    Shutdown(oneshot::Sender<()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_hex() {
        let hash = InfoHash([0xab; 20]);
        let s = hash.to_string();
        assert_eq!(s.len(), 40);
        assert_eq!(s.parse::<InfoHash>().unwrap(), hash);
        assert!("abc".parse::<InfoHash>().is_err());
        assert_eq!(format!("{hash:?}"), "ababababab");
    }

    #[test]
    fn active_status() {
        assert!(TorrentStatus::Downloading.is_active());
        assert!(!TorrentStatus::Paused.is_active());
        assert!(!TorrentStatus::Error.is_active());
        assert_eq!(TorrentStatus::DownloadingMetadata.to_string(), "Downloading metadata");
    }

    #[test]
    fn completed_torrents_are_not_active() {
        let paused = TorrentSnapshot {
            status: TorrentStatus::Paused,
            progress: 0.5,
            ..Default::default()
        };
        assert!(paused.is_active());

        let done = TorrentSnapshot {
            status: TorrentStatus::Paused,
            progress: 1.0,
            completed: true,
            ..Default::default()
        };
        assert!(!done.is_active());

        let seeding = TorrentSnapshot {
            status: TorrentStatus::Seeding,
            progress: 1.0,
            upload_rate: 1000,
            completed: true,
            ..Default::default()
        };
        assert!(!seeding.is_active());
    }
}
