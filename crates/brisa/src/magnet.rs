//! Handle magnet link
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, torrent::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet(pub Magnet_);

impl From<Magnet_> for Magnet {
    fn from(value: Magnet_) -> Self {
        Self(value)
    }
}

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Magnet {
    /// Parse a magnet URI, it must have a v1 info hash.
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        let magnet = Self(Magnet_::new(magnet_url)?);
        magnet.parse_xt_infohash()?;
        Ok(magnet)
    }

    /// The name will come URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> String {
        if let Some(dn) = self.0.display_name() {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.to_string();
            }
        }
        "Unknown".to_owned()
    }

    /// Transform the "xt" field from hex, to an [`InfoHash`].
    pub fn parse_xt_infohash(&self) -> Result<InfoHash, Error> {
        let hash = self.0.hash().ok_or(Error::MagnetNoInfoHash)?;
        let info_hash =
            hex::decode(hash).map_err(|_| Error::MagnetNoInfoHash)?;
        InfoHash::try_from(info_hash).map_err(|_| Error::MagnetNoInfoHash)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn parse_string_to_magnet() {
        let mstr = "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678&dn=My%20Torrent&xl=12345&tr=udp://tracker.example.com:6969";

        let magnet = Magnet::new(mstr).unwrap();
        assert_eq!(magnet.parse_dn(), "My Torrent");
        assert_eq!(
            magnet.parse_xt_infohash().unwrap().to_string(),
            "1234567890abcdef1234567890abcdef12345678"
        );
    }

    #[test]
    fn magnet_without_name() {
        let mstr =
            "magnet:?xt=urn:btih:0000000000000000000000000000000000000000";
        let magnet = Magnet::new(mstr).unwrap();
        assert_eq!(magnet.parse_dn(), "Unknown");
    }

    #[test]
    fn rejects_invalid_magnets() {
        assert!(matches!(
            Magnet::new("http://example.com"),
            Err(Error::MagnetError(_))
        ));
        assert!(Magnet::new("magnet:?dn=name").is_err());
        assert!(Magnet::new("magnet:?xt=urn:btih:zz").is_err());
    }
}
