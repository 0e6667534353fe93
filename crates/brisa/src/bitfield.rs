//! Wrapper types around Bitvec, and the [`PieceMap`] of a torrent.
use std::collections::BTreeSet;

use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], bitvec::prelude::Msb0>;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl Reserved {
    /// Bit of the extension protocol (BEP 10).
    const EXTENDED: usize = 43;

    /// Bit of the DHT protocol (BEP 5).
    const DHT: usize = 63;

    /// Reserved bits of protocols that the client supports.
    pub fn supported(dht: bool) -> Reserved {
        let mut reserved = Reserved::default();
        reserved.0.set(Self::EXTENDED, true);
        reserved.0.set(Self::DHT, dht);
        reserved
    }

    pub fn supports_extended(&self) -> bool {
        self.0[Self::EXTENDED]
    }

    pub fn supports_dht(&self) -> bool {
        self.0[Self::DHT]
    }

    pub fn into_bytes(self) -> [u8; 8] {
        self.0.into_inner()
    }
}

pub trait BrisaBitfield {
    fn from_piece(piece: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; piece]
    }
    /// Set vector to a new len, in bits.
    fn new_and_resize(vec: Vec<u8>, len: usize) -> Bitfield {
        let mut s = Bitfield::from_vec(vec);
        s.resize(len, false);
        s
    }
    /// Set the bit at `index`, growing the bitfield if it is too short.
    fn safe_set(&mut self, index: usize);
}

impl BrisaBitfield for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }
}

/// The download state of a single piece.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PieceState {
    /// No block of this piece is in flight.
    #[default]
    Missing,

    /// Offsets (`begin`) of the blocks of this piece currently in flight.
    Requested(BTreeSet<u32>),

    /// All blocks were written and the SHA-1 matched. Never changes again.
    Verified,
}

/// Tracks which pieces are verified, in flight or missing.
///
/// A piece only becomes [`PieceState::Verified`] through
/// [`PieceMap::mark_verified`], which the torrent calls after the disk
/// confirmed the hash. From then on, every other transition is ignored.
#[derive(Debug, Clone, Default)]
pub struct PieceMap {
    pieces: Vec<PieceState>,
    verified: usize,
}

impl PieceMap {
    pub fn new(pieces: usize) -> Self {
        Self { pieces: vec![PieceState::Missing; pieces], verified: 0 }
    }

    /// Build a map from the bitfield of verified pieces, as returned by a
    /// recheck.
    pub fn from_verified(bitfield: &Bitfield, pieces: usize) -> Self {
        let mut map = Self::new(pieces);
        for index in bitfield.iter_ones().filter(|i| *i < pieces) {
            map.mark_verified(index);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<&PieceState> {
        self.pieces.get(index)
    }

    pub fn is_verified(&self, index: usize) -> bool {
        matches!(self.pieces.get(index), Some(PieceState::Verified))
    }

    pub fn is_missing(&self, index: usize) -> bool {
        matches!(self.pieces.get(index), Some(PieceState::Missing))
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    /// If every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.verified == self.pieces.len()
    }

    /// Pieces that are neither verified nor in flight.
    pub fn missing_count(&self) -> usize {
        self.pieces.iter().filter(|p| **p == PieceState::Missing).count()
    }

    /// Register a block of the piece as in flight. Returns false if the
    /// piece is already verified.
    pub fn mark_requested(&mut self, index: usize, begin: u32) -> bool {
        let Some(state) = self.pieces.get_mut(index) else {
            return false;
        };
        match state {
            PieceState::Verified => false,
            PieceState::Missing => {
                *state = PieceState::Requested(BTreeSet::from([begin]));
                true
            }
            PieceState::Requested(blocks) => {
                blocks.insert(begin);
                true
            }
        }
    }

    /// The block is no longer in flight, either because it arrived, timed
    /// out, or its peer disconnected.
    pub fn release(&mut self, index: usize, begin: u32) {
        let Some(state) = self.pieces.get_mut(index) else {
            return;
        };
        if let PieceState::Requested(blocks) = state {
            blocks.remove(&begin);
            if blocks.is_empty() {
                *state = PieceState::Missing;
            }
        }
    }

    /// Returns true if the piece was not verified before.
    pub fn mark_verified(&mut self, index: usize) -> bool {
        let Some(state) = self.pieces.get_mut(index) else {
            return false;
        };
        if *state == PieceState::Verified {
            return false;
        }
        *state = PieceState::Verified;
        self.verified += 1;
        true
    }

    /// The piece failed the hash check, go back to missing.
    pub fn reset(&mut self, index: usize) {
        if let Some(state) = self.pieces.get_mut(index) {
            if *state != PieceState::Verified {
                *state = PieceState::Missing;
            }
        }
    }

    /// Bitfield of verified pieces, as sent to peers.
    pub fn to_bitfield(&self) -> Bitfield {
        self.pieces.iter().map(|p| *p == PieceState::Verified).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
    }

    #[test]
    fn safe_set() {
        // 0, 1
        let mut bitfield = Bitfield::new_and_resize(vec![0], 2);
        assert_eq!(bitfield.len(), 2);
        // 0, 1, 2
        bitfield.safe_set(2);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield[2]);

        bitfield.safe_set(10);
        assert_eq!(bitfield.len(), 11);
        assert!(bitfield[10]);
    }

    #[test]
    fn reserved_bits() {
        let reserved = Reserved::supported(false);
        assert!(reserved.supports_extended());
        assert!(!reserved.supports_dht());
        assert_eq!(reserved.into_bytes(), [0, 0, 0, 0, 0, 0x10, 0, 0]);

        let reserved = Reserved::supported(true);
        assert!(reserved.supports_dht());
        assert_eq!(reserved.into_bytes(), [0, 0, 0, 0, 0, 0x10, 0, 1]);
    }

    #[test]
    fn new_and_resize() {
        let bitfield = Bitfield::new_and_resize(vec![0], 5);
        assert_eq!(bitfield.len(), 5);

        let bitfield = Bitfield::new_and_resize(vec![0, 0], 9);
        assert_eq!(bitfield.len(), 9);
    }

    #[test]
    fn piece_map_transitions() {
        let mut map = PieceMap::new(3);
        assert_eq!(map.missing_count(), 3);

        assert!(map.mark_requested(0, 0));
        assert!(map.mark_requested(0, 16384));
        assert_eq!(
            map.state(0),
            Some(&PieceState::Requested(BTreeSet::from([0, 16384])))
        );

        map.release(0, 0);
        assert!(!map.is_missing(0));
        map.release(0, 16384);
        assert!(map.is_missing(0));

        assert!(map.mark_verified(1));
        assert!(!map.mark_verified(1));
        assert_eq!(map.verified_count(), 1);
    }

    #[test]
    fn verified_piece_is_immutable() {
        let mut map = PieceMap::new(2);
        map.mark_verified(0);

        assert!(!map.mark_requested(0, 0));
        map.reset(0);
        map.release(0, 0);
        assert!(map.is_verified(0));
        assert_eq!(map.to_bitfield(), bitvec![u8, Msb0; 1, 0]);
    }

    #[test]
    fn piece_map_from_bitfield() {
        let bitfield = bitvec![u8, Msb0; 1, 0, 1, 0, 0, 0, 0, 0];
        let map = PieceMap::from_verified(&bitfield, 3);
        assert_eq!(map.len(), 3);
        assert_eq!(map.verified_count(), 2);
        assert!(!map.is_complete());
        assert!(map.is_verified(2));
    }
}
