//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`CoreCodec`](super::CoreCodec), but care should be
//! taken not to discard the underlying receive and send buffers.

use std::{io, io::Cursor};
use tracing::warn;

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield::Reserved, error::Error, extensions::core::PSTR, peer::PeerId,
    torrent::InfoHash,
};

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        // protocol length prefix
        debug_assert_eq!(pstr_len, 19);

        buf.put_u8(pstr.len() as u8);

        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(pstr, PSTR);

        // payload
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // `get_*` integer extractors consume the message bytes by advancing
        // buf's internal cursor. However, we don't want to do this as at this
        // point we aren't sure we have the full message in the buffer, and thus
        // we just want to peek at this value.
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        // the length prefix byte is not consumed yet, so it counts too
        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() > payload_len {
            buf.advance(1);
        } else {
            return Ok(None);
        }

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr,
            pstr_len: pstr.len() as u8,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field tells which extensions the peer supports.
/// The peer id is usually the client name and version.
#[derive(Clone, Debug, Writable, Readable, PartialEq)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Size of the handshake on the wire.
    pub const LEN: usize = 68;

    pub fn new(info_hash: InfoHash, peer_id: PeerId, dht: bool) -> Self {
        Self {
            pstr_len: 19,
            pstr: PSTR,
            reserved: Reserved::supported(dht).into_bytes(),
            info_hash,
            peer_id,
        }
    }

    pub fn reserved(&self) -> Reserved {
        Reserved::from(self.reserved)
    }

    pub fn serialize(&self) -> Result<[u8; 68], Error> {
        let mut buf: [u8; 68] = [0u8; 68];
        let temp = self
            .write_to_vec_with_ctx(BigEndian {})
            .map_err(Error::SpeedyError)?;

        buf.copy_from_slice(&temp[..]);

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Self::read_from_buffer_with_ctx(BigEndian {}, buf)
            .map_err(Error::SpeedyError)
    }

    /// Validate the handshake of the remote peer against ours.
    pub fn validate(&self, target: &Self) -> bool {
        if self.info_hash != target.info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return false;
        }
        if target.pstr_len != 19 {
            warn!("! handshake with wrong pstr_len, dropping connection");
            return false;
        }
        if target.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return false;
        }
        true
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId([7u8; 20]);
        let our_handshake = Handshake::new(info_hash, peer_id.clone(), false);

        assert_eq!(our_handshake.pstr_len, 19);
        assert_eq!(our_handshake.pstr, PSTR);
        assert_eq!(our_handshake.peer_id, peer_id);
        assert_eq!(our_handshake.info_hash, info_hash);

        let bytes = our_handshake.serialize().unwrap();
        assert_eq!(
            bytes,
            [
                19, 66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112,
                114, 111, 116, 111, 99, 111, 108, 0, 0, 0, 0, 0, 16, 0, 0, 5,
                5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 7, 7,
                7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7
            ]
        );
        assert_eq!(Handshake::deserialize(&bytes).unwrap(), our_handshake);
    }

    #[test]
    fn codec_waits_for_full_handshake() {
        let ours = Handshake::new(InfoHash([1; 20]), PeerId([2; 20]), true);
        let bytes = ours.serialize().unwrap();

        let mut buf = BytesMut::from(&bytes[..40]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[40..]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        let theirs = HandshakeCodec.decode(&mut buf).unwrap().unwrap();

        assert!(ours.validate(&theirs));
        assert!(theirs.reserved().supports_dht());
        // the keep-alive after the handshake is left for the next codec
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn rejects_other_protocols() {
        let mut buf = BytesMut::from(&[18u8, 1, 2, 3][..]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());

        let ours = Handshake::new(InfoHash([1; 20]), PeerId([2; 20]), false);
        let other = Handshake::new(InfoHash([9; 20]), PeerId([2; 20]), false);
        assert!(!ours.validate(&other));
    }
}
