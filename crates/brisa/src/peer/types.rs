use std::{
    fmt::Display,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};
use tokio_util::codec::Framed;

use crate::{
    bitfield::Bitfield,
    counter::Counter,
    encryption::PeerStream,
    extensions::core::{BlockInfo, Handshake, HandshakeCodec},
    metainfo::TorrentMetadata,
};

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Client prefix, in the Azureus style.
    const PREFIX: &'static [u8; 8] = b"-BR0100-";

    /// A peer id with the client prefix followed by random characters.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(Self::PREFIX);
        for (b, c) in id[8..]
            .iter_mut()
            .zip(rand::thread_rng().sample_iter(&Alphanumeric))
        {
            *b = c;
        }
        Self(id)
    }

    /// A peer id that does not identify the client.
    pub fn anonymous() -> Self {
        Self(rand::random())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("The PeerId must have exactly 20 bytes");
        }
        let mut buff = [0u8; 20];
        buff[..20].copy_from_slice(&value[..20]);
        Ok(PeerId(buff))
    }
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// State of a connected peer that is shared between its event loop and the
/// torrent. The torrent reads it to run the choke algorithm and build
/// snapshots.
#[derive(Debug)]
pub struct PeerCtx {
    pub id: PeerId,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    /// If the connection is using message stream encryption.
    pub encrypted: bool,
    pub counter: Counter,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub peer_choking: AtomicBool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    pub peer_interested: AtomicBool,
    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: AtomicBool,
    /// If peer is choked, we don't allow them to download pieces from us.
    pub am_choking: AtomicBool,
    /// The peer has every piece.
    pub is_seed: AtomicBool,
}

impl PeerCtx {
    pub fn new(
        id: PeerId,
        remote_addr: SocketAddr,
        direction: Direction,
        encrypted: bool,
    ) -> Self {
        Self {
            id,
            remote_addr,
            direction,
            encrypted,
            counter: Counter::new(),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            am_interested: AtomicBool::new(false),
            am_choking: AtomicBool::new(true),
            is_seed: AtomicBool::new(false),
        }
    }

    pub fn is_seed(&self) -> bool {
        self.is_seed.load(Ordering::Relaxed)
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Relaxed)
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Relaxed)
    }
}

/// A connection accepted by the engine, handshaked and routed to the torrent
/// of its info hash. Our handshake is not sent yet.
#[derive(Debug)]
pub struct InboundPeer {
    pub socket: Framed<PeerStream, HandshakeCodec>,
    pub handshake: Handshake,
    pub remote_addr: SocketAddr,
}

/// Messages used to control the peer state or to make the peer forward a
/// message.
#[derive(Debug)]
pub enum PeerMsg {
    /// When we download a full piece, we need to send Have's
    /// to peers that dont Have it.
    HavePiece(usize),
    /// The torrent has blocks for us, or other peers released theirs.
    RequestBlocks,
    /// Sends a Cancel message to cancel a block info that we
    /// expect the peer to send us, because we requested it previously.
    CancelBlock(BlockInfo),
    /// Sent by the choke algorithm.
    Choke,
    Unchoke,
    /// Sent when the torrent has downloaded the entire info of the torrent,
    /// and checked the files on disk. The bitfield has the pieces we have.
    HaveInfo(Arc<TorrentMetadata>, Bitfield),
}

impl PeerMsg {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HavePiece(_) => "have piece",
            Self::RequestBlocks => "request blocks",
            Self::CancelBlock(_) => "cancel block",
            Self::Choke => "choke",
            Self::Unchoke => "unchoke",
            Self::HaveInfo(..) => "have info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], b"-BR0100-");
        assert!(id.0[8..].iter().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(PeerId::generate(), id);
    }

    #[test]
    fn peer_id_from_vec() {
        assert!(PeerId::try_from(vec![0; 19]).is_err());
        assert_eq!(PeerId::try_from(vec![1; 20]).unwrap(), PeerId([1; 20]));
        assert_eq!(PeerId([0xff; 20]).to_string(), "ff".repeat(20));
    }
}
