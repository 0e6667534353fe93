//! The extended handshake of the extension protocol.
//!
//! <http://www.bittorrent.org/beps/bep_0010.html>

use bendy::{
    decoding::{FromBencode, Object, ResultExt},
    encoding::ToBencode,
};

use crate::{error::Error, extensions::ExtendedMessage};

/// Extended message id of the handshake, every other id is negotiated in
/// the `m` dictionary.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The id that we ask peers to use when sending us `ut_metadata` messages.
pub const LOCAL_UT_METADATA_ID: u8 = 3;

/// Number of outstanding requests we accept from a peer.
pub const LOCAL_REQQ: u16 = 250;

/// Client name and version, sent in the `v` field.
pub const CLIENT_VERSION: &str = concat!("Brisa ", env!("CARGO_PKG_VERSION"));

/// This is the payload of the extension protocol described on:
/// BEP 10 - Extension Protocol
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extension {
    /// messages (supported extensions)
    pub m: M,
    /// local TCP listen port
    pub p: Option<u16>,
    /// a string identifying the client and the version
    pub v: Option<String>,
    /// number of outstanding requests messages this client supports
    /// without dropping any.
    pub reqq: Option<u16>,
    /// added by BEP 9
    /// the size of the metadata file, which is the
    /// info-dictionary part of the metainfo(.torrent) file
    pub metadata_size: Option<u32>,
}

/// Lists all extensions that a peer supports, the value is the id that
/// must be used when sending messages of that extension to the peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct M {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
}

impl Extension {
    /// The extended handshake that we send to peers.
    ///
    /// In anonymous mode, the client version and the listen port are
    /// left out.
    pub fn supported(
        metadata_size: Option<u32>,
        port: u16,
        anonymous: bool,
    ) -> Self {
        Self {
            m: M { ut_metadata: Some(LOCAL_UT_METADATA_ID), ut_pex: None },
            p: (!anonymous).then_some(port),
            v: (!anonymous).then(|| CLIENT_VERSION.to_owned()),
            reqq: Some(LOCAL_REQQ),
            metadata_size,
        }
    }
}

impl TryFrom<Extension> for ExtendedMessage {
    type Error = Error;

    fn try_from(value: Extension) -> Result<Self, Self::Error> {
        Ok(ExtendedMessage(EXTENDED_HANDSHAKE_ID, value.to_bencode()?))
    }
}

impl TryFrom<&[u8]> for Extension {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Extension::from_bencode(value)?)
    }
}

impl ToBencode for M {
    const MAX_DEPTH: usize = 20;
    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(ut_metadata) = self.ut_metadata {
                e.emit_pair(b"ut_metadata", ut_metadata)?;
            }
            if let Some(ut_pex) = self.ut_pex {
                e.emit_pair(b"ut_pex", ut_pex)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for M {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut ut_metadata = None;
        let mut ut_pex = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"ut_metadata", value) => {
                    ut_metadata = u8::decode_bencode_object(value)
                        .context("ut_metadata")
                        .map(Some)?;
                }
                (b"ut_pex", value) => {
                    ut_pex = u8::decode_bencode_object(value)
                        .context("ut_pex")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        // an id of 0 means the extension was disabled
        Ok(Self {
            ut_metadata: ut_metadata.filter(|id| *id != 0),
            ut_pex: ut_pex.filter(|id| *id != 0),
        })
    }
}

impl ToBencode for Extension {
    const MAX_DEPTH: usize = 20;
    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"m", &self.m)?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(p) = self.p {
                e.emit_pair(b"p", p)?;
            }
            if let Some(reqq) = self.reqq {
                e.emit_pair(b"reqq", reqq)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for Extension {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut p = None;
        let mut v = None;
        let mut reqq = None;
        let mut metadata_size = None;
        let mut m = M::default();

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => {
                    m = M::decode_bencode_object(value).context("m")?
                }
                (b"metadata_size", value) => {
                    metadata_size = u32::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"p", value) => {
                    p = u16::decode_bencode_object(value)
                        .context("p")
                        .map(Some)?;
                }
                (b"reqq", value) => {
                    reqq = u16::decode_bencode_object(value)
                        .context("reqq")
                        .map(Some)?;
                }
                (b"v", value) => {
                    v = String::decode_bencode_object(value)
                        .context("v")
                        .map(Some)?;
                }
                _ => {}
            }
        }
        Ok(Self { m, p, v, reqq, metadata_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei5205e1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Transmission 2.94e
    const TRANSMISSION: &[u8] = b"d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei5205e1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Transmission 2.94e";

    #[test]
    fn from_bytes_to_extension() {
        let ext = Extension::try_from(TRANSMISSION).unwrap();

        assert_eq!(
            ext,
            Extension {
                m: M { ut_metadata: Some(3), ut_pex: Some(1) },
                p: Some(51413),
                v: Some("Transmission 2.94".to_owned()),
                reqq: Some(512),
                metadata_size: Some(5205),
            }
        );
    }

    #[test]
    fn ignores_unknown_keys_when_encoding() {
        let ext = Extension::try_from(TRANSMISSION).unwrap();
        let bytes = ext.to_bencode().unwrap();
        assert!(!bytes.windows(11).any(|w| w == b"upload_only"));
        assert_eq!(Extension::from_bencode(&bytes).unwrap(), ext);
    }

    #[test]
    fn anonymous_handshake_hides_client() {
        let ext = Extension::supported(Some(100), 51413, true);
        assert_eq!(ext.v, None);
        assert_eq!(ext.p, None);
        assert_eq!(ext.m.ut_metadata, Some(LOCAL_UT_METADATA_ID));

        let ext = Extension::supported(None, 51413, false);
        assert_eq!(ext.p, Some(51413));
        assert!(ext.v.unwrap().starts_with("Brisa"));

        let msg: ExtendedMessage =
            Extension::supported(None, 1, false).try_into().unwrap();
        assert_eq!(msg.0, EXTENDED_HANDSHAKE_ID);
    }

    #[test]
    fn disabled_extension() {
        let ext =
            Extension::try_from(&b"d1:md11:ut_metadatai0eee"[..]).unwrap();
        assert_eq!(ext.m.ut_metadata, None);
    }
}
