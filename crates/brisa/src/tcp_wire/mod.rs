//! Types of the "TCP Wire" protocol between Peers in the network.
//! Peers will follow this protocol to exchange information about torrents.

use bytes::{BufMut, BytesMut};
use tokio::io;

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// Tha last block of a piece might be smallar.
pub const BLOCK_LEN: u32 = 16384;

/// Largest block a remote peer may request from us.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// A Block is a subset of a Piece,
/// pieces are subsets of the entire Torrent data.
///
/// When peers send data (seed) to us, they send us Blocks.
/// This happens on the "Piece" message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data. 16 KiB most of the times,
    /// but the last block of a piece *might* be smaller.
    pub block: Vec<u8>,
}

impl Block {
    /// Encodes the block in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        let piece_index = self
            .index
            .try_into()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        buf.put_u32(piece_index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
        Ok(())
    }

    /// Validate the [`Block`]. Like most clients, we only accept data
    /// <= 16kiB.
    pub fn is_valid(&self) -> bool {
        !self.block.is_empty() && self.block.len() <= BLOCK_LEN as usize
    }
}

/// The representation of a [`Block`], a BlockRequest.
///
/// When we ask a peer to give us a [`Block`], we send this struct,
/// using the "Request" message of the tcp wire protocol.
///
/// This is almost identical to the [`Block`] struct,
/// the only difference is that instead of having a `block`,
/// we have a `len` representing the len of the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        BlockInfo {
            index: val.index as u32,
            begin: val.begin,
            len: val.block.len() as u32,
        }
    }
}

impl BlockInfo {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }
    pub fn begin(mut self, begin: u32) -> Self {
        self.begin = begin;
        self
    }
    pub fn len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }
    /// Encodes the block info in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
        Ok(())
    }
    /// Validate a [`BlockInfo`] received from a peer against the size of its
    /// piece.
    pub fn is_valid(&self, piece_size: u32) -> bool {
        self.len > 0
            && self.len <= MAX_REQUEST_LEN
            && self.begin.checked_add(self.len).is_some_and(|end| end <= piece_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_info_validation() {
        let piece_size = 3 * BLOCK_LEN + 100;
        assert!(BlockInfo::new().is_valid(piece_size));
        assert!(BlockInfo::new().begin(3 * BLOCK_LEN).len(100).is_valid(piece_size));
        assert!(!BlockInfo::new().begin(3 * BLOCK_LEN).is_valid(piece_size));
        assert!(!BlockInfo::new().len(0).is_valid(piece_size));
        assert!(!BlockInfo::new().begin(u32::MAX).is_valid(piece_size));
    }

    #[test]
    fn block_into_block_info() {
        let block = Block { index: 3, begin: BLOCK_LEN, block: vec![0; 10] };
        assert!(block.is_valid());
        assert_eq!(
            BlockInfo::from(&block),
            BlockInfo::new().index(3).begin(BLOCK_LEN).len(10)
        );
    }
}
