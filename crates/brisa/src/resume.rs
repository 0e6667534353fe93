//! Resume data, the state of a torrent that survives restarts.
//!
//! Stored as `<resume_dir>/<info hash>.toml`.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, read_to_string, remove_file, write},
    io,
};
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BrisaBitfield},
    error::Error,
    metainfo::TorrentMetadata,
    torrent::InfoHash,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeFile {
    pub path: PathBuf,
    pub length: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    /// Hex encoded.
    pub info_hash: String,
    pub name: String,
    pub save_path: PathBuf,
    pub pieces: usize,
    /// Bitfield of the verified pieces, hex encoded.
    pub bitfield: String,
    pub files: Vec<ResumeFile>,
}

impl ResumeData {
    pub fn new(
        metadata: &TorrentMetadata,
        save_path: &Path,
        bitfield: &Bitfield,
    ) -> Self {
        Self {
            info_hash: metadata.info_hash.to_string(),
            name: metadata.name.clone(),
            save_path: save_path.to_path_buf(),
            pieces: metadata.num_pieces(),
            bitfield: hex::encode(bitfield.as_raw_slice()),
            files: metadata
                .files
                .iter()
                .map(|f| ResumeFile { path: f.path.clone(), length: f.length })
                .collect(),
        }
    }

    pub fn path(resume_dir: &Path, info_hash: &InfoHash) -> PathBuf {
        resume_dir.join(format!("{info_hash}.toml"))
    }

    /// The pieces that were verified when the data was saved.
    pub fn verified(&self) -> Result<Bitfield, Error> {
        let bytes = hex::decode(&self.bitfield).map_err(|_| Error::ResumeInvalid)?;
        if bytes.len() * 8 < self.pieces {
            return Err(Error::ResumeInvalid);
        }
        Ok(Bitfield::new_and_resize(bytes, self.pieces))
    }

    /// If the data describes the torrent saved at `save_path`, and every file
    /// is still on disk with its full size.
    pub async fn matches_layout(
        &self,
        metadata: &TorrentMetadata,
        save_path: &Path,
    ) -> bool {
        if self.info_hash != metadata.info_hash.to_string()
            || self.save_path != save_path
            || self.pieces != metadata.num_pieces()
            || self.files.len() != metadata.files.len()
        {
            return false;
        }
        for (file, entry) in self.files.iter().zip(&metadata.files) {
            if file.path != entry.path || file.length != entry.length {
                return false;
            }
            let on_disk = tokio::fs::metadata(save_path.join(&file.path)).await;
            if !on_disk.is_ok_and(|m| m.len() == file.length) {
                return false;
            }
        }
        true
    }

    pub async fn save(&self, resume_dir: &Path) -> Result<(), Error> {
        create_dir_all(resume_dir)
            .await
            .map_err(|_| Error::FolderOpenError(resume_dir.display().to_string()))?;

        let path = resume_dir.join(format!("{}.toml", self.info_hash));
        let s = toml::to_string(self)?;
        write(&path, s).await?;
        debug!("saved resume data {path:?}");
        Ok(())
    }

    /// Returns `None` if the torrent has no resume data.
    pub async fn load(
        resume_dir: &Path,
        info_hash: &InfoHash,
    ) -> Result<Option<Self>, Error> {
        let path = Self::path(resume_dir, info_hash);
        let s = match read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data: Self = toml::from_str(&s)?;
        if data.info_hash != info_hash.to_string() {
            return Err(Error::ResumeInvalid);
        }
        Ok(Some(data))
    }

    pub async fn delete(resume_dir: &Path, info_hash: &InfoHash) -> Result<(), Error> {
        match remove_file(Self::path(resume_dir, info_hash)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitvec::prelude::*;
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;
    use crate::metainfo::FileEntry;

    fn temp_dir() -> PathBuf {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(format!("brisa-resume-{suffix}"))
    }

    fn metadata() -> Arc<TorrentMetadata> {
        Arc::new(TorrentMetadata {
            info_hash: InfoHash([3; 20]),
            name: "t".into(),
            piece_length: 4,
            piece_hashes: vec![[0; 20]; 10],
            files: vec![
                FileEntry { path: "t/a".into(), length: 30, offset: 0 },
                FileEntry { path: "t/b".into(), length: 10, offset: 30 },
            ],
            total_size: 40,
            info_bytes: vec![],
        })
    }

    #[tokio::test]
    async fn save_load_and_delete() -> Result<(), Error> {
        let dir = temp_dir();
        let metadata = metadata();
        let info_hash = metadata.info_hash;

        assert!(ResumeData::load(&dir, &info_hash).await?.is_none());

        let bitfield = bitvec![u8, Msb0; 1, 0, 1, 0, 0, 0, 0, 0, 0, 1];
        let data = ResumeData::new(&metadata, &dir, &bitfield);
        data.save(&dir).await?;

        let loaded = ResumeData::load(&dir, &info_hash).await?.unwrap();
        assert_eq!(loaded, data);
        assert_eq!(loaded.verified()?, bitfield);

        ResumeData::delete(&dir, &info_hash).await?;
        assert!(ResumeData::load(&dir, &info_hash).await?.is_none());
        ResumeData::delete(&dir, &info_hash).await?;

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn layout_must_match_files_on_disk() -> Result<(), Error> {
        let dir = temp_dir();
        let metadata = metadata();
        let bitfield = Bitfield::repeat(true, 10);
        let data = ResumeData::new(&metadata, &dir, &bitfield);

        // files are missing
        assert!(!data.matches_layout(&metadata, &dir).await);

        tokio::fs::create_dir_all(dir.join("t")).await?;
        tokio::fs::write(dir.join("t/a"), vec![0; 30]).await?;
        tokio::fs::write(dir.join("t/b"), vec![0; 9]).await?;
        // b is truncated
        assert!(!data.matches_layout(&metadata, &dir).await);

        tokio::fs::write(dir.join("t/b"), vec![0; 10]).await?;
        assert!(data.matches_layout(&metadata, &dir).await);
        // another save path
        assert!(!data.matches_layout(&metadata, &dir.join("t")).await);

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[test]
    fn invalid_bitfield() {
        let mut data = ResumeData::new(&metadata(), Path::new("/tmp"), &Bitfield::repeat(false, 10));
        data.bitfield = "zz".into();
        assert!(data.verified().is_err());
        data.bitfield = "ff".into();
        assert!(data.verified().is_err());
        data.bitfield = "ffc0".into();
        assert_eq!(data.verified().unwrap().count_ones(), 10);
    }
}
