use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo, BLOCK_LEN};
use crate::{bitfield::Bitfield, error::Error, tcp_wire::MAX_REQUEST_LEN};

/// Largest message we accept: a piece message with the largest block a peer
/// could send us, plus the id and the index/begin fields. Metadata messages
/// are at most 16 KiB of payload plus a small bencoded header, so they fit.
pub const MAX_MESSAGE_SIZE: u32 = 1 + 8 + BLOCK_LEN + MAX_REQUEST_LEN;

/// The first value is decided when the peer sends its extension header, in the
/// m field.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

impl From<ExtendedMessage> for Core {
    fn from(value: ExtendedMessage) -> Self {
        Self::Extended(value)
    }
}

/// Core messages exchanged after a successful handshake.
/// These are from the vanilla protocol, plus the extended message
/// that carries the extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// The DHT port of the peer.
    Port(u16),
    Extended(ExtendedMessage),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for CoreId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            20 => Extended,
            v => return Err(v),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CoreCodec;

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Core,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Core::KeepAlive => {
                buf.put_u32(0);
            }
            Core::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(CoreId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            Core::Choke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Choke as u8);
            }
            Core::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Unchoke as u8);
            }
            Core::Interested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Interested as u8);
            }
            Core::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::NotInterested as u8);
            }
            Core::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(CoreId::Have as u8);
                let piece_index = piece_index.try_into().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;
                buf.put_u32(piece_index);
            }
            // <len=0013><id=6><index><begin><length>
            Core::Request(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Request as u8);
                block.encode(buf)?;
            }
            Core::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(CoreId::Piece as u8);
                block.encode(buf)?;
            }
            Core::Cancel(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Cancel as u8);
                block.encode(buf)?;
            }
            Core::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(CoreId::Port as u8);
                buf.put_u16(port);
            }
            Core::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(payload.len() as u32 + 2);
                buf.put_u8(CoreId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at length prefix without consuming
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

        if size == 0 {
            buf.advance(4);
            return Ok(Some(Core::KeepAlive));
        }

        if size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(size));
        }

        let size = size as usize;

        // incomplete message, wait for the rest of the packets without
        // advancing the cursor.
        if buf.len() < 4 + size {
            buf.reserve(4 + size - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let msg_id = buf.get_u8();

        let Ok(msg_id) = CoreId::try_from(msg_id) else {
            // unknown message id, skip the segment and try the next one
            warn!("unknown message_id {msg_id:?}");
            buf.advance(size - 1);
            return self.decode(buf);
        };

        // the payload of fixed size messages must match exactly
        let expected = match msg_id {
            CoreId::Choke
            | CoreId::Unchoke
            | CoreId::Interested
            | CoreId::NotInterested => Some(1),
            CoreId::Have => Some(1 + 4),
            CoreId::Request | CoreId::Cancel => Some(1 + 12),
            CoreId::Port => Some(1 + 2),
            CoreId::Piece => (size < 1 + 8).then_some(1 + 8),
            CoreId::Extended => (size < 2).then_some(2),
            CoreId::Bitfield => None,
        };
        if expected.is_some_and(|e| e != size) {
            return Err(Error::MessageResponse);
        }

        let msg = match msg_id {
            // <len=0001><id=0>
            CoreId::Choke => Core::Choke,

            // <len=0001><id=1>
            CoreId::Unchoke => Core::Unchoke,

            // <len=0001><id=2>
            CoreId::Interested => Core::Interested,

            // <len=0001><id=3>
            CoreId::NotInterested => Core::NotInterested,

            // <len=0005><id=4><piece index>
            CoreId::Have => Core::Have(buf.get_u32() as usize),

            // <len=0001+X><id=5><bitfield>
            CoreId::Bitfield => {
                let bitfield = buf.copy_to_bytes(size - 1).to_vec();
                Core::Bitfield(Bitfield::from_vec(bitfield))
            }

            // <len=0013><id=6><index><begin><length>
            CoreId::Request => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Core::Request(BlockInfo { index, begin, len })
            }

            // <len=0009+X><id=7><index><begin><block>
            CoreId::Piece => {
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let block = buf.copy_to_bytes(size - 9).to_vec();
                Core::Piece(Block { index, begin, block })
            }

            // <len=0013><id=8><index><begin><length>
            CoreId::Cancel => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Core::Cancel(BlockInfo { index, begin, len })
            }

            // <len=0003><id=9><listen-port>
            CoreId::Port => Core::Port(buf.get_u16()),

            // <len=002 + payload><id=20><ext_id><payload>
            CoreId::Extended => {
                let ext_id = buf.get_u8();
                let payload = buf.copy_to_bytes(size - 2).to_vec();
                Core::Extended(ExtendedMessage(ext_id, payload))
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::{bitvec, prelude::Msb0};
    use bytes::{Buf, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn fragmented_extended_message() {
        let mut codec = CoreCodec {};
        let mut buffer = BytesMut::new();

        let metadata = vec![0xAA; 50_000];

        // 1 (msg_id) + 1 (ext_id) + 50_000 (payload)
        let total_length = 50_002_u32;
        let header = total_length.to_be_bytes();

        let mut message_content = Vec::with_capacity(total_length as usize);
        message_content.push(CoreId::Extended as u8);
        message_content.push(0);
        message_content.extend_from_slice(&metadata);

        let chunk1 = &message_content[..15_002];
        let chunk2 = &message_content[15_002..35_002];
        let chunk3 = &message_content[35_002..];

        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(chunk1);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(chunk2);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(chunk3);

        let keepalive = [0x00, 0x00, 0x00, 0x00];
        let interested = [0x00, 0x00, 0x00, 0x01, 0x02];

        buffer.extend_from_slice(&keepalive);
        buffer.extend_from_slice(&interested);

        let msg = codec.decode(&mut buffer).unwrap().unwrap();

        match msg {
            Core::Extended(ExtendedMessage(ext_id, payload)) => {
                assert_eq!(ext_id, 0);
                assert_eq!(payload.len(), 50_000);
                assert!(payload.iter().all(|&b| b == 0xAA));
            }
            _ => panic!("Wrong message type"),
        }

        let msg = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(msg, Core::KeepAlive);

        let msg = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(msg, Core::Interested);

        assert!(buffer.is_empty());
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn extended() {
        let mut buf = BytesMut::new();
        let msg: Core = ExtendedMessage(0, vec![]).into();
        CoreCodec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), 6);
        assert_eq!(buf.get_u32(), 2);
        assert_eq!(buf.get_u8(), CoreId::Extended as u8);
        assert_eq!(buf.get_u8(), 0);

        let mut buf = BytesMut::new();
        CoreCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn bitfield() {
        let mut original = bitvec![u8, Msb0; 0; 10];
        let original_len_bytes = original.len().div_ceil(8);

        original.set(8, true);
        original.set(9, true);

        let msg = Core::Bitfield(original.clone());

        let mut buf = BytesMut::new();
        CoreCodec.encode(msg, &mut buf).unwrap();

        assert_eq!(buf.get_u32(), 1 + original_len_bytes as u32);
        assert_eq!(buf.get_u8(), CoreId::Bitfield as u8);
        // the spare bits of the last byte are sent as zeroes
        assert_eq!(buf.to_vec(), vec![0b0000_0000, 0b1100_0000]);
    }

    #[test]
    fn request() {
        let mut buf = BytesMut::new();
        let msg = Core::Request(BlockInfo::default());
        CoreCodec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), 17);
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), CoreId::Request as u8);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(buf.get_u32(), BLOCK_LEN);

        let mut buf = BytesMut::new();
        CoreCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn piece() {
        let mut buf = BytesMut::new();
        let msg = Core::Piece(Block { index: 2, begin: 0, block: vec![9] });
        CoreCodec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.get_u32(), 9 + 1);
        assert_eq!(buf.get_u8(), CoreId::Piece as u8);
        assert_eq!(buf.get_u32(), 2);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(buf.get_u8(), 9);

        let mut buf = BytesMut::new();
        CoreCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn port() {
        let mut buf = BytesMut::new();
        CoreCodec.encode(Core::Port(6881), &mut buf).unwrap();
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 3, 9, 0x1a, 0xe1]);
        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(Core::Port(6881)));
    }

    #[test]
    fn skips_unknown_messages() {
        // id 13 (suggest piece, fast extension) is not supported
        let mut buf = BytesMut::from(&[0, 0, 0, 5, 13, 0, 0, 0, 1][..]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(Core::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_messages_are_errors() {
        // a `have` with 2 bytes of payload
        let mut buf = BytesMut::from(&[0, 0, 0, 3, 4, 0, 1][..]);
        assert!(CoreCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::MessageTooLarge(_))
        ));
    }
}
