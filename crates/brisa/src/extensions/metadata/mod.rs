//! Types for the Metadata protocol, used to download the info dictionary of
//! a magnet link from other peers.
//!
//! <http://www.bittorrent.org/beps/bep_0009.html>

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::ToBencode,
};

use crate::{error::Error, extensions::ExtendedMessage};

/// Metadata is exchanged in pieces of 16 KiB, the last one may be smaller.
pub const METADATA_PIECE_LEN: usize = 16384;

/// Largest info dictionary we are willing to download.
pub const MAX_METADATA_SIZE: u32 = 16 * 1024 * 1024;

/// Metadata dict that is the header of every message of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// One of [`MetadataMsgType`].
    pub msg_type: u8,
    pub piece: u32,
    pub total_size: Option<u32>,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MetadataMsgType {
    Request = 0,
    Response = 1,
    Reject = 2,
}

impl TryFrom<u8> for MetadataMsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MetadataMsgType::*;
        match value {
            v if v == Request as u8 => Ok(Request),
            v if v == Response as u8 => Ok(Response),
            v if v == Reject as u8 => Ok(Reject),
            _ => Err(Error::BencodeError),
        }
    }
}

/// Messages of the metadata protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMsg {
    Request(u32),

    /// Also named "Data", the payload is the slice of the info dict.
    Response { piece: u32, total_size: u32, payload: Vec<u8> },

    Reject(u32),
}

impl MetadataMsg {
    /// Decode the payload of an extended message.
    ///
    /// The bencoded dict is followed by the raw metadata bytes in the case
    /// of a `Response`, so we can't decode the whole buffer in one go.
    pub fn from_payload(buf: &[u8]) -> Result<Self, Error> {
        let mut decoder = Decoder::new(buf);
        let object = decoder.next_object()?.ok_or(Error::BencodeError)?;
        let raw = object.try_into_dictionary()?.into_raw()?;
        let dict_len = raw.len();
        let metadata = Metadata::from_bencode(raw)?;

        Ok(match MetadataMsgType::try_from(metadata.msg_type)? {
            MetadataMsgType::Request => Self::Request(metadata.piece),
            MetadataMsgType::Reject => Self::Reject(metadata.piece),
            MetadataMsgType::Response => Self::Response {
                piece: metadata.piece,
                total_size: metadata.total_size.ok_or(Error::BencodeError)?,
                payload: buf[dict_len..].to_vec(),
            },
        })
    }

    /// Encode into the payload of an extended message.
    pub fn to_payload(&self) -> Result<Vec<u8>, Error> {
        let (msg_type, piece, total_size) = match self {
            Self::Request(piece) => (MetadataMsgType::Request, *piece, None),
            Self::Reject(piece) => (MetadataMsgType::Reject, *piece, None),
            Self::Response { piece, total_size, .. } => {
                (MetadataMsgType::Response, *piece, Some(*total_size))
            }
        };

        let mut bytes =
            Metadata { msg_type: msg_type as u8, piece, total_size }
                .to_bencode()?;

        if let Self::Response { payload, .. } = self {
            bytes.extend_from_slice(payload);
        }

        Ok(bytes)
    }

    /// Build the `Response` for a piece of the info dict, or a `Reject` if
    /// the piece is out of range.
    pub fn data(piece: u32, info: &[u8]) -> Self {
        let start = piece as usize * METADATA_PIECE_LEN;
        if start >= info.len() {
            return Self::Reject(piece);
        }
        let end = (start + METADATA_PIECE_LEN).min(info.len());

        Self::Response {
            piece,
            total_size: info.len() as u32,
            payload: info[start..end].to_vec(),
        }
    }

    /// Wrap into an extended message for a peer that uses `ext_id` for the
    /// metadata protocol.
    pub fn into_extended(self, ext_id: u8) -> Result<ExtendedMessage, Error> {
        Ok(ExtendedMessage(ext_id, self.to_payload()?))
    }
}

/// How many metadata pieces an info dict of `size` bytes has.
pub fn metadata_pieces(size: usize) -> usize {
    size.div_ceil(METADATA_PIECE_LEN)
}

impl FromBencode for Metadata {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut msg_type = None;
        let mut piece = None;
        let mut total_size = None;

        let mut dict_dec = object.try_into_dictionary()?;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"msg_type", value) => {
                    msg_type = u8::decode_bencode_object(value)
                        .context("msg_type")
                        .map(Some)?;
                }
                (b"piece", value) => {
                    piece = u32::decode_bencode_object(value)
                        .context("piece")
                        .map(Some)?;
                }
                (b"total_size", value) => {
                    total_size = u32::decode_bencode_object(value)
                        .context("total_size")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let msg_type = msg_type
            .ok_or_else(|| decoding::Error::missing_field("msg_type"))?;
        let piece =
            piece.ok_or_else(|| decoding::Error::missing_field("piece"))?;

        Ok(Self { msg_type, piece, total_size })
    }
}

impl ToBencode for Metadata {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"msg_type", self.msg_type)?;
            e.emit_pair(b"piece", self.piece)?;
            if let Some(total_size) = self.total_size {
                e.emit_pair(b"total_size", total_size)?;
            };
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reject() {
        let req = MetadataMsg::Request(2);
        let bytes = req.to_payload().unwrap();
        assert_eq!(bytes, b"d8:msg_typei0e5:piecei2ee");
        assert_eq!(MetadataMsg::from_payload(&bytes).unwrap(), req);

        let reject = MetadataMsg::Reject(1);
        let bytes = reject.to_payload().unwrap();
        assert_eq!(bytes, b"d8:msg_typei2e5:piecei1ee");
        assert_eq!(MetadataMsg::from_payload(&bytes).unwrap(), reject);
    }

    #[test]
    fn response_keeps_trailing_payload() {
        // the payload itself looks like bencode, it must not be parsed
        let mut bytes = b"d8:msg_typei1e5:piecei0e10:total_sizei8ee".to_vec();
        bytes.extend_from_slice(b"d1:ai1ee");

        let msg = MetadataMsg::from_payload(&bytes).unwrap();
        assert_eq!(
            msg,
            MetadataMsg::Response {
                piece: 0,
                total_size: 8,
                payload: b"d1:ai1ee".to_vec()
            }
        );
        assert_eq!(msg.to_payload().unwrap(), bytes);
    }

    #[test]
    fn data_splits_info_in_pieces() {
        let info = vec![7u8; METADATA_PIECE_LEN + 10];
        assert_eq!(metadata_pieces(info.len()), 2);

        match MetadataMsg::data(1, &info) {
            MetadataMsg::Response { piece, total_size, payload } => {
                assert_eq!(piece, 1);
                assert_eq!(total_size as usize, info.len());
                assert_eq!(payload.len(), 10);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(MetadataMsg::data(2, &info), MetadataMsg::Reject(2));
    }

    #[test]
    fn response_without_size_is_invalid() {
        let bytes = b"d8:msg_typei1e5:piecei0ee";
        assert!(MetadataMsg::from_payload(bytes).is_err());
        assert!(MetadataMsg::from_payload(b"d8:msg_typei7e5:piecei0ee").is_err());
    }
}
