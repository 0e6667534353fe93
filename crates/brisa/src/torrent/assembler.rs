//! Assembles the info dict of a magnet torrent from the pieces sent by
//! peers.
use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::{
    error::Error,
    extensions::{metadata_pieces, MAX_METADATA_SIZE, METADATA_PIECE_LEN},
    peer::PeerId,
    torrent::InfoHash,
};

#[derive(Debug)]
pub struct MetadataAssembler {
    info_hash: InfoHash,
    /// Size of the info dict that is being assembled.
    size: Option<usize>,
    /// Size advertised by each peer.
    advertised: HashMap<PeerId, usize>,
    /// A size whose dict did not match the info hash.
    failed: Option<usize>,
    pieces: Vec<Option<Vec<u8>>>,
    /// Pieces requested and not answered yet.
    requested: HashMap<u32, PeerId>,
}

impl MetadataAssembler {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            size: None,
            advertised: HashMap::new(),
            failed: None,
            pieces: Vec::new(),
            requested: HashMap::new(),
        }
    }

    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Bytes of the info dict received so far.
    pub fn received_bytes(&self) -> usize {
        self.pieces.iter().flatten().map(|p| p.len()).sum()
    }

    /// A peer advertised the size of the info dict. The first size is used
    /// until a dict of that size fails the hash check.
    pub fn set_size(&mut self, peer_id: &PeerId, size: usize) {
        if size == 0 || size > MAX_METADATA_SIZE as usize {
            return;
        }
        self.advertised.insert(peer_id.clone(), size);
        if self.size.is_none() {
            self.use_size(size);
        }
    }

    fn use_size(&mut self, size: usize) {
        debug!("metadata size {size}");
        self.size = Some(size);
        self.pieces = vec![None; metadata_pieces(size)];
        self.requested.clear();
    }

    /// The size advertised by most peers, preferring one that did not
    /// fail.
    fn best_size(&self) -> Option<usize> {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for size in self.advertised.values() {
            *counts.entry(*size).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(size, count)| (*count, Some(*size) != self.failed, *size))
            .map(|(size, _)| size)
    }

    /// The next piece to request from `peer_id`.
    pub fn next_request(&mut self, peer_id: &PeerId) -> Option<u32> {
        let piece = self
            .pieces
            .iter()
            .enumerate()
            .find(|(i, p)| p.is_none() && !self.requested.contains_key(&(*i as u32)))
            .map(|(i, _)| i as u32)?;
        self.requested.insert(piece, peer_id.clone());
        Some(piece)
    }

    /// The request was rejected or timed out.
    pub fn release(&mut self, piece: u32) {
        self.requested.remove(&piece);
    }

    pub fn peer_disconnected(&mut self, peer_id: &PeerId) {
        self.requested.retain(|_, p| p != peer_id);
        self.advertised.remove(peer_id);
    }

    fn piece_len(&self, piece: usize) -> usize {
        let size = self.size.unwrap_or_default();
        (size - piece * METADATA_PIECE_LEN).min(METADATA_PIECE_LEN)
    }

    /// Store a piece. Returns the info dict once every piece arrived and the
    /// dict hashes to the info hash.
    ///
    /// If the hash does not match, every piece is discarded and
    /// [`Error::PieceInvalid`] is returned.
    pub fn receive(
        &mut self,
        piece: u32,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let index = piece as usize;
        self.requested.remove(&piece);

        if index >= self.pieces.len() || payload.len() != self.piece_len(index) {
            warn!("metadata piece {piece} of {} bytes is not valid", payload.len());
            return Err(Error::MessageResponse);
        }

        self.pieces[index] = Some(payload);

        if self.pieces.iter().any(|p| p.is_none()) {
            return Ok(None);
        }

        let info: Vec<u8> = self.pieces.iter_mut().flat_map(|p| p.take().unwrap_or_default()).collect();
        let hash = sha1_smol::Sha1::from(&info).digest().bytes();

        if hash != self.info_hash.0 {
            warn!("assembled metadata does not match the info hash");
            // the size itself may be the lie, start over with the size that
            // most peers advertise.
            self.failed = self.size;
            self.size = None;
            self.pieces.clear();
            self.requested.clear();
            if let Some(size) = self.best_size() {
                self.use_size(size);
            }
            return Err(Error::PieceInvalid);
        }

        Ok(Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(info: &[u8]) -> MetadataAssembler {
        let hash = sha1_smol::Sha1::from(info).digest().bytes();
        let mut assembler = MetadataAssembler::new(InfoHash(hash));
        assembler.set_size(&PeerId([9; 20]), info.len());
        assembler
    }

    #[test]
    fn assembles_in_any_order() {
        let info: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut assembler = assembler(&info);
        let peer = PeerId([1; 20]);

        assert_eq!(assembler.next_request(&peer), Some(0));
        assert_eq!(assembler.next_request(&peer), Some(1));
        assert_eq!(assembler.next_request(&peer), Some(2));
        assert_eq!(assembler.next_request(&peer), None);

        let chunk = |i: usize| {
            info[i * METADATA_PIECE_LEN..info.len().min((i + 1) * METADATA_PIECE_LEN)].to_vec()
        };

        assert_eq!(assembler.receive(2, chunk(2)).unwrap(), None);
        assert_eq!(assembler.receive(0, chunk(0)).unwrap(), None);
        assert_eq!(assembler.received_bytes(), info.len() - METADATA_PIECE_LEN);
        assert_eq!(assembler.receive(1, chunk(1)).unwrap(), Some(info));
    }

    #[test]
    fn rejects_bad_pieces_and_bad_hash() {
        let info = vec![7u8; 100];
        let mut assembler = assembler(&info);
        let peer = PeerId([1; 20]);

        // wrong length
        assert!(assembler.receive(0, vec![7; 99]).is_err());
        // out of range
        assert!(assembler.receive(1, vec![7; 100]).is_err());

        // released pieces are requested again
        assert_eq!(assembler.next_request(&peer), Some(0));
        assembler.peer_disconnected(&peer);
        assert_eq!(assembler.next_request(&peer), Some(0));

        assert!(matches!(assembler.receive(0, vec![8; 100]), Err(Error::PieceInvalid)));
        assert_eq!(assembler.received_bytes(), 0);
        assert_eq!(assembler.receive(0, info.clone()).unwrap(), Some(info));
    }

    #[test]
    fn first_size_wins() {
        let mut assembler = MetadataAssembler::new(InfoHash([0; 20]));
        let peer = PeerId([1; 20]);
        assembler.set_size(&peer, 0);
        assert_eq!(assembler.size(), None);
        assembler.set_size(&peer, MAX_METADATA_SIZE as usize + 1);
        assert_eq!(assembler.size(), None);
        assembler.set_size(&peer, 20_000);
        assembler.set_size(&PeerId([2; 20]), 10);
        assert_eq!(assembler.size(), Some(20_000));
        assert_eq!(assembler.next_request(&peer), Some(0));
    }

    #[test]
    fn wrong_size_is_replaced_after_a_hash_failure() {
        let info = vec![7u8; 100];
        let hash = sha1_smol::Sha1::from(&info).digest().bytes();
        let mut assembler = MetadataAssembler::new(InfoHash(hash));
        let liar = PeerId([1; 20]);
        let honest = PeerId([2; 20]);

        assembler.set_size(&liar, 50);
        assembler.set_size(&honest, 100);
        assert_eq!(assembler.size(), Some(50));

        assert_eq!(assembler.next_request(&liar), Some(0));
        assert!(matches!(assembler.receive(0, vec![1; 50]), Err(Error::PieceInvalid)));

        assert_eq!(assembler.size(), Some(100));
        assert_eq!(assembler.next_request(&honest), Some(0));
        assert_eq!(assembler.receive(0, info.clone()).unwrap(), Some(info));
    }
}
