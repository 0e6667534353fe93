//! Decides which blocks to request from which peer.
//!
//! Pieces are picked rarest first, the ties going to the lowest index, and
//! the blocks of a piece are handed out front to back. Outside of endgame a
//! block is assigned to a single peer. Once every piece is verified or in
//! flight, the scheduler enters endgame and hands out the blocks that are
//! already in flight to other peers, the first response wins and the other
//! requests are cancelled.

use std::{collections::BTreeSet, sync::Arc};

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::{
    bitfield::{Bitfield, PieceMap},
    extensions::core::BlockInfo,
    metainfo::TorrentMetadata,
    peer::PeerId,
};

#[derive(Debug)]
pub struct PieceScheduler {
    metadata: Arc<TorrentMetadata>,
    pieces: PieceMap,

    /// How many connected peers have each piece.
    availability: Vec<u32>,

    peer_pieces: HashMap<PeerId, Bitfield>,

    /// Peers that were asked for each block, more than one only in endgame.
    in_flight: HashMap<BlockInfo, Vec<PeerId>>,

    /// Blocks that arrived, of pieces that are not verified yet. The offsets
    /// are `begin`.
    received: HashMap<usize, BTreeSet<u32>>,

    endgame: bool,
}

impl PieceScheduler {
    pub fn new(metadata: Arc<TorrentMetadata>, pieces: PieceMap) -> Self {
        let num_pieces = metadata.num_pieces();
        Self {
            metadata,
            pieces,
            availability: vec![0; num_pieces],
            peer_pieces: HashMap::new(),
            in_flight: HashMap::new(),
            received: HashMap::new(),
            endgame: false,
        }
    }

    pub fn pieces(&self) -> &PieceMap {
        &self.pieces
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.is_complete()
    }

    pub fn in_endgame(&self) -> bool {
        self.endgame
    }

    /// Verified pieces.
    pub fn bitfield(&self) -> Bitfield {
        self.pieces.to_bitfield()
    }

    /// Bytes of the verified pieces.
    pub fn verified_bytes(&self) -> u64 {
        (0..self.pieces.len())
            .filter(|i| self.pieces.is_verified(*i))
            .map(|i| self.metadata.piece_size(i) as u64)
            .sum()
    }

    /// Number of peers that have the piece.
    pub fn availability(&self, index: usize) -> u32 {
        self.availability.get(index).copied().unwrap_or(0)
    }

    /// If the peer has a piece that we don't.
    pub fn is_interesting(&self, peer_id: &PeerId) -> bool {
        self.peer_pieces.get(peer_id).is_some_and(|pieces| {
            pieces.iter_ones().any(|i| {
                i < self.pieces.len() && !self.pieces.is_verified(i)
            })
        })
    }

    /// If the peer has all pieces.
    pub fn is_seed(&self, peer_id: &PeerId) -> bool {
        self.peer_pieces.get(peer_id).is_some_and(|pieces| {
            pieces.count_ones() >= self.pieces.len() && !self.pieces.is_empty()
        })
    }

    /// Replace the pieces of the peer.
    pub fn peer_bitfield(&mut self, peer_id: &PeerId, mut bitfield: Bitfield) {
        bitfield.resize(self.pieces.len(), false);
        if let Some(old) = self.peer_pieces.remove(peer_id) {
            for i in old.iter_ones() {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        for i in bitfield.iter_ones() {
            self.availability[i] += 1;
        }
        self.peer_pieces.insert(peer_id.clone(), bitfield);
    }

    pub fn peer_have(&mut self, peer_id: &PeerId, index: usize) {
        if index >= self.pieces.len() {
            return;
        }
        let len = self.pieces.len();
        let pieces = self
            .peer_pieces
            .entry(peer_id.clone())
            .or_insert_with(|| Bitfield::repeat(false, len));

        if !pieces[index] {
            pieces.set(index, true);
            self.availability[index] += 1;
        }
    }

    /// Forget the peer, every block that was only requested from it can be
    /// picked again right away.
    pub fn peer_disconnected(&mut self, peer_id: &PeerId) {
        if let Some(pieces) = self.peer_pieces.remove(peer_id) {
            for i in pieces.iter_ones() {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        let blocks: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|(_, peers)| peers.contains(peer_id))
            .map(|(block, _)| *block)
            .collect();

        debug!("releasing {} blocks of {peer_id:?}", blocks.len());
        self.release(peer_id, &blocks);
    }

    /// The peer will not answer these requests, because they timed out or it
    /// choked us.
    pub fn release(&mut self, peer_id: &PeerId, blocks: &[BlockInfo]) {
        for block in blocks {
            let Some(peers) = self.in_flight.get_mut(block) else {
                continue;
            };
            peers.retain(|p| p != peer_id);
            if peers.is_empty() {
                self.in_flight.remove(block);
                let received = self
                    .received
                    .get(&(block.index as usize))
                    .is_some_and(|r| r.contains(&block.begin));
                if !received {
                    self.pieces.release(block.index as usize, block.begin);
                }
            }
        }
        self.update_endgame();
    }

    /// A block arrived from `peer_id`.
    ///
    /// Returns `None` if the block was not requested or already arrived from
    /// someone else, in which case it must be dropped. Otherwise, returns the
    /// other peers that were asked for the same block, which should be sent a
    /// cancel.
    pub fn block_received(
        &mut self,
        peer_id: &PeerId,
        block: &BlockInfo,
    ) -> Option<Vec<PeerId>> {
        let peers = self.in_flight.get(block)?;
        if !peers.contains(peer_id) {
            return None;
        }
        let others = peers.iter().filter(|p| *p != peer_id).cloned().collect();
        self.in_flight.remove(block);
        self.received
            .entry(block.index as usize)
            .or_default()
            .insert(block.begin);
        Some(others)
    }

    /// The disk verified the piece.
    pub fn piece_verified(&mut self, index: usize) -> bool {
        self.received.remove(&index);
        self.in_flight.retain(|b, _| b.index as usize != index);
        let verified = self.pieces.mark_verified(index);
        self.update_endgame();
        verified
    }

    /// The hash of the piece did not match, download it again.
    pub fn piece_failed(&mut self, index: usize) {
        self.received.remove(&index);
        self.in_flight.retain(|b, _| b.index as usize != index);
        self.pieces.reset(index);
        self.update_endgame();
    }

    fn update_endgame(&mut self) {
        let endgame =
            !self.pieces.is_complete() && self.pieces.missing_count() == 0;
        if endgame != self.endgame {
            debug!("endgame {endgame}");
        }
        self.endgame = endgame;
    }

    /// If the block was neither requested nor received.
    fn is_free(&self, block: &BlockInfo) -> bool {
        !self.in_flight.contains_key(block)
            && !self
                .received
                .get(&(block.index as usize))
                .is_some_and(|r| r.contains(&block.begin))
    }

    /// Pieces of the peer that are not verified, rarest first and lowest
    /// index on ties.
    fn candidate_pieces(&self, peer_pieces: &Bitfield) -> Vec<usize> {
        let mut candidates: Vec<usize> = peer_pieces
            .iter_ones()
            .filter(|i| *i < self.pieces.len() && !self.pieces.is_verified(*i))
            .collect();
        candidates.sort_by_key(|i| (self.availability[*i], *i));
        candidates
    }

    /// Pick up to `qnt` blocks to request from the peer.
    pub fn pick_blocks(&mut self, peer_id: &PeerId, qnt: usize) -> Vec<BlockInfo> {
        let mut picked = Vec::new();
        let Some(peer_pieces) = self.peer_pieces.get(peer_id) else {
            return picked;
        };
        let candidates = self.candidate_pieces(peer_pieces);

        'outer: for index in &candidates {
            for block in self.metadata.block_infos(*index) {
                if picked.len() >= qnt {
                    break 'outer;
                }
                if self.is_free(&block) {
                    picked.push(block);
                }
            }
        }

        for block in &picked {
            self.in_flight.insert(*block, vec![peer_id.clone()]);
            self.pieces.mark_requested(block.index as usize, block.begin);
        }
        self.update_endgame();

        // in endgame, ask for blocks that other peers are taking too long to
        // send.
        if self.endgame && picked.len() < qnt {
            let mut duplicates = Vec::new();
            'outer: for index in &candidates {
                for block in self.metadata.block_infos(*index) {
                    if picked.len() + duplicates.len() >= qnt {
                        break 'outer;
                    }
                    let Some(peers) = self.in_flight.get(&block) else {
                        continue;
                    };
                    if !peers.contains(peer_id) {
                        duplicates.push(block);
                    }
                }
            }
            for block in &duplicates {
                if let Some(peers) = self.in_flight.get_mut(block) {
                    peers.push(peer_id.clone());
                }
            }
            picked.extend(duplicates);
        }

        picked
    }

    /// Blocks in flight to the peer.
    pub fn requested_from(&self, peer_id: &PeerId) -> HashSet<BlockInfo> {
        self.in_flight
            .iter()
            .filter(|(_, peers)| peers.contains(peer_id))
            .map(|(block, _)| *block)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use bitvec::prelude::*;

    use super::*;
    use crate::{metainfo::FileEntry, torrent::InfoHash};

    /// A single file torrent with `pieces` pieces of `piece_length` bytes.
    pub(crate) fn metadata(pieces: usize, piece_length: u32) -> Arc<TorrentMetadata> {
        let total_size = pieces as u64 * piece_length as u64;
        Arc::new(TorrentMetadata {
            info_hash: InfoHash([0; 20]),
            name: "test".into(),
            piece_length,
            piece_hashes: vec![[0; 20]; pieces],
            files: vec![FileEntry {
                path: PathBuf::from("test"),
                length: total_size,
                offset: 0,
            }],
            total_size,
            info_bytes: vec![],
        })
    }

    fn peer(n: u8) -> PeerId {
        PeerId([n; 20])
    }

    fn scheduler(pieces: usize, piece_length: u32) -> PieceScheduler {
        PieceScheduler::new(metadata(pieces, piece_length), PieceMap::new(pieces))
    }

    #[test]
    fn rarest_first_with_lowest_index_on_ties() {
        let mut s = scheduler(4, 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1, 1, 1, 1]);
        s.peer_bitfield(&peer(2), bitvec![u8, Msb0; 1, 1, 0, 0]);

        // 2 and 3 are the rarest, 2 has the lowest index.
        let blocks = s.pick_blocks(&peer(1), 1);
        assert_eq!(blocks, vec![BlockInfo { index: 2, begin: 0, len: 16384 }]);
        let blocks = s.pick_blocks(&peer(1), 1);
        assert_eq!(blocks[0].index, 3);

        // only 0 and 1 are left, same availability
        let blocks = s.pick_blocks(&peer(2), 2);
        assert_eq!(blocks.iter().map(|b| b.index).collect::<Vec<_>>(), [0, 1]);
    }

    #[test]
    fn blocks_are_sequential_within_a_piece() {
        let mut s = scheduler(2, 3 * 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1, 0]);
        let blocks = s.pick_blocks(&peer(1), 10);
        assert_eq!(
            blocks.iter().map(|b| b.begin).collect::<Vec<_>>(),
            [0, 16384, 32768]
        );
        // peer does not have piece 1
        assert!(s.pick_blocks(&peer(1), 10).is_empty());
    }

    #[test]
    fn no_block_is_assigned_twice_outside_endgame() {
        let mut s = scheduler(4, 2 * 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1, 1, 1, 1]);
        s.peer_bitfield(&peer(2), bitvec![u8, Msb0; 1, 1, 1, 1]);

        let a = s.pick_blocks(&peer(1), 3);
        let b = s.pick_blocks(&peer(2), 3);
        assert!(!s.in_endgame());
        assert!(a.iter().all(|x| !b.contains(x)));
    }

    #[test]
    fn disconnect_releases_blocks_immediately() {
        let mut s = scheduler(1, 2 * 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1]);
        s.peer_bitfield(&peer(2), bitvec![u8, Msb0; 1]);

        let a = s.pick_blocks(&peer(1), 1);
        assert_eq!(a[0].begin, 0);
        s.peer_disconnected(&peer(1));
        assert_eq!(s.availability(0), 1);

        // the next pick has the block of the peer that left
        let b = s.pick_blocks(&peer(2), 2);
        assert_eq!(b.iter().map(|b| b.begin).collect::<Vec<_>>(), [0, 16384]);
    }

    #[test]
    fn endgame_duplicates_and_cancels() {
        let mut s = scheduler(2, 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1, 1]);
        s.peer_bitfield(&peer(2), bitvec![u8, Msb0; 1, 1]);

        let a = s.pick_blocks(&peer(1), 2);
        assert_eq!(a.len(), 2);
        assert!(s.in_endgame());

        // peer 2 gets the same blocks
        let b = s.pick_blocks(&peer(2), 5);
        assert_eq!(a, b);

        // the first response wins, the other peer gets a cancel
        let cancel = s.block_received(&peer(2), &a[0]).unwrap();
        assert_eq!(cancel, vec![peer(1)]);
        // the late response is dropped
        assert!(s.block_received(&peer(1), &a[0]).is_none());

        // no more duplicates for a block that arrived
        s.peer_bitfield(&peer(3), bitvec![u8, Msb0; 1, 1]);
        let c = s.pick_blocks(&peer(3), 5);
        assert_eq!(c, vec![a[1]]);

        // nor for a verified piece
        assert!(s.piece_verified(a[0].index as usize));
        s.peer_bitfield(&peer(4), bitvec![u8, Msb0; 1, 1]);
        let d = s.pick_blocks(&peer(4), 5);
        assert!(d.iter().all(|b| b.index != a[0].index));
    }

    #[test]
    fn hash_mismatch_makes_piece_selectable_again() {
        let mut s = scheduler(1, 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1]);
        let a = s.pick_blocks(&peer(1), 1);
        assert!(s.block_received(&peer(1), &a[0]).is_some());
        assert!(s.pick_blocks(&peer(1), 1).is_empty());

        s.piece_failed(0);
        assert!(s.pieces().is_missing(0));
        assert_eq!(s.pick_blocks(&peer(1), 1), a);

        assert!(s.block_received(&peer(1), &a[0]).is_some());
        assert!(s.piece_verified(0));
        assert!(s.is_complete());
        assert!(!s.in_endgame());
        assert_eq!(s.verified_bytes(), 16384);
    }

    #[test]
    fn unsolicited_blocks_are_dropped() {
        let mut s = scheduler(1, 16384);
        s.peer_bitfield(&peer(1), bitvec![u8, Msb0; 1]);
        let block = BlockInfo { index: 0, begin: 0, len: 16384 };
        assert!(s.block_received(&peer(1), &block).is_none());
    }

    #[test]
    fn have_updates_availability_and_interest() {
        let mut s = scheduler(3, 16384);
        assert!(!s.is_interesting(&peer(1)));
        s.peer_have(&peer(1), 1);
        s.peer_have(&peer(1), 1);
        s.peer_have(&peer(1), 99);
        assert_eq!(s.availability(1), 1);
        assert!(s.is_interesting(&peer(1)));
        assert!(!s.is_seed(&peer(1)));

        s.peer_bitfield(&peer(2), bitvec![u8, Msb0; 1, 1, 1, 0, 0, 0, 0, 0]);
        assert!(s.is_seed(&peer(2)));
        assert_eq!(s.availability(1), 2);
    }
}
