//! Metainfo is a .torrent file with information about the Torrent.
//! From the magnet link, we get the Info from other peers.

use std::path::{Component, PathBuf};

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};

use crate::{
    error::Error,
    tcp_wire::{BlockInfo, BLOCK_LEN},
    torrent::InfoHash,
};

/// The top level dictionary of a .torrent file. Trackers are parsed but not
/// used by the engine, the peers are supplied from the outside.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: Option<String>,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub creation_date: Option<u64>,
    pub info: Info,
}

impl MetaInfo {
    /// Parse the bytes of a .torrent file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let meta_info = Self::from_bencode(buf)?;
        meta_info.info.validate()?;
        Ok(meta_info)
    }
}

/// File related information.
///
/// In a multi file format, `name` is name of the directory, and `files`
/// is some. In the single file format, `file_length` is some instead.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// If the torrent has only 1 file, this value is some, and files is none
    pub file_length: Option<u64>,

    /// If the torrent has many files, this is some, and file_length is none.
    pub files: Option<Vec<File>>,

    /// name of the file, or of the root directory.
    pub name: String,

    /// length in bytes of each piece, the last piece may have a smaller length
    pub piece_length: u32,

    /// A (byte) string consisting of the concatenation of all 20-byte SHA1
    /// hash values, one per piece.
    pub pieces: Vec<u8>,

    // the following is internal computed data and not part of the dict.
    pub metadata_size: usize,
    pub info_hash: InfoHash,
    /// The dict exactly as it was decoded, keys that are not modeled
    /// here included. Empty when the info was built in memory.
    pub raw: Vec<u8>,
}

impl Info {
    /// Parse a raw info dictionary, as received from the metadata protocol.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let info = Self::from_bencode(buf)?;
        info.validate()?;
        Ok(info)
    }

    pub(crate) fn info_hash(buf: &[u8]) -> InfoHash {
        InfoHash(sha1_smol::Sha1::from(buf).digest().bytes())
    }

    /// Calculate how many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Get the size in bytes of the files of the torrent.
    pub fn get_torrent_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Check the invariants that the rest of the engine relies on.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |s: &str| Err(Error::MetaInfoInvalid(s.to_owned()));

        if self.piece_length == 0 {
            return invalid("piece length is zero");
        }
        if self.pieces.len() % 20 != 0 {
            return invalid("pieces is not a multiple of 20");
        }
        if self.file_length.is_none() == self.files.is_none() {
            return invalid("exactly one of `length` and `files` must be set");
        }
        if !is_safe_component(&self.name) {
            return invalid("name is not a valid file name");
        }
        if let Some(files) = &self.files {
            if files.is_empty() {
                return invalid("files is empty");
            }
            for file in files {
                if file.path.is_empty()
                    || !file.path.iter().all(|p| is_safe_component(p))
                {
                    return invalid("file path escapes the download dir");
                }
            }
        }
        let expected = self.get_torrent_size().div_ceil(self.piece_length as u64);
        if expected != self.pieces() as u64 {
            return invalid("number of pieces does not match the size");
        }
        Ok(())
    }
}

fn is_safe_component(s: &str) -> bool {
    let mut components = std::path::Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Files in the [`Info`] are relative to the root folder name,
/// but do not contain them as the first item in the vector.
#[derive(Debug, PartialEq, Clone, Default, Hash, Eq)]
pub struct File {
    /// Length of the file in bytes.
    pub length: u64,
    /// Path of the file, excluding the parent name.
    pub path: Vec<String>,
}

/// A file of the torrent, with its position in the torrent's byte space.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    /// Relative to the download dir of the torrent.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte of this file in the torrent.
    pub offset: u64,
}

/// The immutable metadata of a torrent, built once from a .torrent file or
/// from the info dict received over the metadata protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
    /// The raw info dict, served to peers that download it from us.
    pub info_bytes: Vec<u8>,
}

impl TorrentMetadata {
    /// Build from a validated [`Info`] and the raw bytes it was decoded from.
    pub fn new(info: Info, info_bytes: Vec<u8>) -> Self {
        let piece_hashes = info
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect();

        let files = match &info.files {
            None => vec![FileEntry {
                path: PathBuf::from(&info.name),
                length: info.file_length.unwrap_or(0),
                offset: 0,
            }],
            Some(files) => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|f| {
                        let mut path = PathBuf::from(&info.name);
                        path.extend(&f.path);
                        let entry =
                            FileEntry { path, length: f.length, offset };
                        offset += f.length;
                        entry
                    })
                    .collect()
            }
        };

        Self {
            info_hash: info.info_hash,
            total_size: info.get_torrent_size(),
            name: info.name,
            piece_length: info.piece_length,
            piece_hashes,
            files,
            info_bytes,
        }
    }

    /// Parse the bytes of a .torrent file.
    pub fn from_torrent_file(buf: &[u8]) -> Result<Self, Error> {
        let mut meta_info = MetaInfo::from_bytes(buf)?;
        // the info hash is over the raw bytes, which must be served as they
        // are.
        let info_bytes = match std::mem::take(&mut meta_info.info.raw) {
            raw if raw.is_empty() => meta_info.info.to_bencode()?,
            raw => raw,
        };
        Ok(Self::new(meta_info.info, info_bytes))
    }

    /// Parse a raw info dict. The caller is responsible for checking that its
    /// hash is the one that was expected.
    pub fn from_info_bytes(buf: &[u8]) -> Result<Self, Error> {
        let info = Info::from_bytes(buf)?;
        Ok(Self::new(info, buf.to_vec()))
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Get the size (in bytes) of a piece.
    pub fn piece_size(&self, piece_index: usize) -> u32 {
        if piece_index + 1 == self.num_pieces() {
            let remainder = self.total_size % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        } else {
            self.piece_length
        }
    }

    /// Offset of the first byte of the piece in the torrent.
    pub fn piece_offset(&self, piece_index: usize) -> u64 {
        piece_index as u64 * self.piece_length as u64
    }

    /// Calculate how many blocks there are in a piece.
    pub fn blocks_in_piece(&self, piece_index: usize) -> usize {
        self.piece_size(piece_index).div_ceil(BLOCK_LEN) as usize
    }

    /// All the blocks of a piece, front to back.
    pub fn block_infos(&self, piece_index: usize) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(piece_index);
        (0..self.blocks_in_piece(piece_index) as u32)
            .map(|i| {
                let begin = i * BLOCK_LEN;
                BlockInfo {
                    index: piece_index as u32,
                    begin,
                    len: BLOCK_LEN.min(piece_size - begin),
                }
            })
            .collect()
    }

    /// Total size of the files, in bytes.
    pub fn get_torrent_size(&self) -> u64 {
        self.total_size
    }
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = None;
        let mut path = None;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let length =
            length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let path = path.ok_or_else(|| decoding::Error::missing_field("path"))?;

        Ok(Self { length, path })
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(announce) = &self.announce {
                e.emit_pair(b"announce", announce)?;
            }

            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }

            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }

            if let Some(creation_date) = &self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }

            e.emit_pair(b"info", &self.info)
        })?;

        Ok(())
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u64::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, announce_list, comment, creation_date, info })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        // the info hash is computed over the exact bytes of the dict
        let bytes = object.try_into_dictionary()?.into_raw()?;
        let metadata_size = bytes.len();
        let info_hash = Info::info_hash(bytes);
        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("file.length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info {
            files,
            file_length,
            name,
            piece_length,
            pieces,
            metadata_size,
            info_hash,
            raw: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_info(total_size: u64, piece_length: u32) -> Info {
        let pieces = total_size.div_ceil(piece_length as u64) as usize;
        Info {
            file_length: Some(total_size),
            name: "test".to_string(),
            piece_length,
            pieces: vec![0; pieces * 20],
            ..Default::default()
        }
    }

    fn metadata(info: Info) -> TorrentMetadata {
        let bytes = info.to_bencode().unwrap();
        TorrentMetadata::from_info_bytes(&bytes).unwrap()
    }

    /// piece_length: 32 KiB + 100
    /// -----------------------------------
    /// | b: 16 KiB | b: 16 KiB | b: 100  |
    /// -----------------------------------
    #[test]
    fn block_infos_with_partial_last_block() {
        let m = metadata(single_file_info(2 * (2 * 16384 + 100), 2 * 16384 + 100));
        let blocks = m.block_infos(1);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], BlockInfo { index: 1, begin: 0, len: 16384 });
        assert_eq!(blocks[2], BlockInfo { index: 1, begin: 32768, len: 100 });
    }

    /// piece_length: 16 KiB, total: 40 KiB
    /// ---------------------------------
    /// | p: 16 KiB | p: 16 KiB | p: 8 KiB |
    /// ---------------------------------
    #[test]
    fn piece_size() {
        let m = metadata(single_file_info(40 * 1024, 16384));
        assert_eq!(m.num_pieces(), 3);
        assert_eq!(m.piece_size(0), 16384);
        assert_eq!(m.piece_size(2), 8192);
        assert_eq!(m.piece_offset(2), 32768);
        assert_eq!(m.blocks_in_piece(2), 1);

        let m = metadata(single_file_info(32 * 1024, 16384));
        assert_eq!(m.piece_size(1), 16384);
    }

    #[test]
    fn should_decode_multi_file_torrent() -> Result<(), Error> {
        let info = Info {
            files: Some(vec![
                File { length: 10, path: vec!["a.txt".into()] },
                File { length: 20, path: vec!["dir".into(), "b.txt".into()] },
            ]),
            name: "root".into(),
            piece_length: 16,
            pieces: vec![1; 2 * 20],
            ..Default::default()
        };
        let meta_info = MetaInfo {
            announce: Some("udp://tracker.example.org:1337".into()),
            comment: Some("test".into()),
            info,
            ..Default::default()
        };

        let bytes = meta_info.to_bencode()?;
        let m = TorrentMetadata::from_torrent_file(&bytes)?;

        assert_eq!(m.name, "root");
        assert_eq!(m.total_size, 30);
        assert_eq!(
            m.files,
            vec![
                FileEntry { path: "root/a.txt".into(), length: 10, offset: 0 },
                FileEntry {
                    path: "root/dir/b.txt".into(),
                    length: 20,
                    offset: 10
                },
            ]
        );
        // the info hash is the hash of the bytes of the info dict
        assert_eq!(m.info_hash, Info::info_hash(&m.info_bytes));
        assert_eq!(Info::from_bytes(&m.info_bytes)?.metadata_size, m.info_bytes.len());
        Ok(())
    }

    #[test]
    fn should_decode_single_file_torrent() -> Result<(), Error> {
        let bytes = b"d8:announce3:url4:infod6:lengthi5e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let meta_info = MetaInfo::from_bytes(bytes)?;
        assert_eq!(meta_info.announce.as_deref(), Some("url"));
        assert_eq!(meta_info.info.file_length, Some(5));

        let m = TorrentMetadata::from_torrent_file(bytes)?;
        assert_eq!(m.files[0].path, PathBuf::from("a.txt"));
        assert_eq!(m.piece_hashes, vec![[b'a'; 20]]);
        Ok(())
    }

    #[test]
    fn keeps_keys_that_are_not_modeled() -> Result<(), Error> {
        let info = b"d6:lengthi5e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaa7:privatei1e6:source3:abce";
        let mut torrent = b"d8:announce3:url4:info".to_vec();
        torrent.extend_from_slice(info);
        torrent.push(b'e');

        let m = TorrentMetadata::from_torrent_file(&torrent)?;
        assert_eq!(m.info_bytes, info.to_vec());
        assert_eq!(m.info_hash, Info::info_hash(info));
        assert_eq!(Info::info_hash(&m.info_bytes), m.info_hash);

        let m = TorrentMetadata::from_info_bytes(info)?;
        assert_eq!(m.info_hash, Info::info_hash(info));
        Ok(())
    }

    #[test]
    fn rejects_malformed_info() {
        // 5 bytes of hashes
        let bytes = b"d4:infod6:lengthi5e4:name5:a.txt12:piece lengthi16384e6:pieces5:aaaaaee";
        assert!(MetaInfo::from_bytes(bytes).is_err());

        // two pieces for a 5 byte file
        let mut info = single_file_info(5, 16384);
        info.pieces = vec![0; 40];
        assert!(info.validate().is_err());

        let mut info = single_file_info(5, 16384);
        info.name = "../etc".into();
        assert!(info.validate().is_err());

        let info = Info {
            files: Some(vec![File { length: 5, path: vec!["..".into()] }]),
            name: "root".into(),
            piece_length: 16384,
            pieces: vec![0; 20],
            ..Default::default()
        };
        assert!(info.validate().is_err());

        assert!(MetaInfo::from_bytes(b"not bencode").is_err());
    }
}
