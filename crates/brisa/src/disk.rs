//! Disk is responsible for file I/O of all Torrents.
//!
//! Blocks are buffered in memory until their piece is complete, the piece is
//! hashed from the buffer and only flushed to the files if the hash matches
//! the one in the metadata. The torrent is told that the piece is verified
//! after the flush.
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    fs::{create_dir_all, remove_dir, remove_file, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{
        mpsc::{self, Receiver, UnboundedSender},
        oneshot::Sender,
    },
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::Bitfield,
    error::Error,
    extensions::core::{Block, BlockInfo},
    metainfo::TorrentMetadata,
    torrent::{DiskEvent, InfoHash},
};

#[derive(Debug)]
pub enum DiskMsg {
    /// Create the files of the torrent, allocating them to their final size,
    /// and hash the pieces that are already on disk. If `claimed` is given,
    /// only those pieces are hashed, otherwise every piece whose files
    /// existed is. Returns the verified pieces.
    NewTorrent {
        metadata: Arc<TorrentMetadata>,
        download_dir: PathBuf,
        events: UnboundedSender<DiskEvent>,
        claimed: Option<Bitfield>,
        recipient: Sender<Result<Bitfield, Error>>,
    },
    /// Buffer the block, once all blocks of its piece arrived, the piece is
    /// validated and written.
    WriteBlock {
        info_hash: InfoHash,
        block: Block,
    },
    ReadBlock {
        info_hash: InfoHash,
        block_info: BlockInfo,
        recipient: Sender<Result<Vec<u8>, Error>>,
    },
    /// Forget the torrent and its buffers, optionally deleting its files.
    DropTorrent {
        info_hash: InfoHash,
        delete_files: bool,
        recipient: Sender<()>,
    },
    Quit,
}

/// Blocks of a piece that is being downloaded.
#[derive(Debug)]
struct PieceBuffer {
    data: Vec<u8>,
    /// Offsets of the blocks written into `data`.
    blocks: HashSet<u32>,
    received: usize,
}

impl PieceBuffer {
    fn new(size: u32) -> Self {
        Self {
            data: vec![0; size as usize],
            blocks: HashSet::new(),
            received: 0,
        }
    }
}

#[derive(Debug)]
struct DiskTorrent {
    metadata: Arc<TorrentMetadata>,
    download_dir: PathBuf,
    events: UnboundedSender<DiskEvent>,
    buffers: HashMap<usize, PieceBuffer>,
}

impl DiskTorrent {
    fn file_path(&self, file: usize) -> PathBuf {
        self.download_dir.join(&self.metadata.files[file].path)
    }
}

/// A contiguous region of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    /// Index of the file in [`TorrentMetadata::files`].
    pub file: usize,
    /// Offset inside the file.
    pub offset: u64,
    pub len: u64,
}

/// Map `len` bytes starting at the torrent `offset` to the regions of the
/// files that hold them. A range may cross file boundaries, and empty files
/// never hold any byte.
pub fn file_spans(
    metadata: &TorrentMetadata,
    offset: u64,
    len: u64,
) -> Vec<FileSpan> {
    let end = offset + len;
    metadata
        .files
        .iter()
        .enumerate()
        .filter_map(|(file, entry)| {
            let file_end = entry.offset + entry.length;
            let start = offset.max(entry.offset);
            let stop = end.min(file_end);
            (start < stop).then_some(FileSpan {
                file,
                offset: start - entry.offset,
                len: stop - start,
            })
        })
        .collect()
}

/// The Disk struct responsabilities:
/// - Open and create files, create directories
/// - Buffer blocks until their piece is complete
/// - Validate the hash of pieces and write them
/// - Read blocks for peers that download from us
#[derive(Debug)]
pub struct Disk {
    pub tx: mpsc::Sender<DiskMsg>,
    torrents: HashMap<InfoHash, DiskTorrent>,
    rx: Receiver<DiskMsg>,
}

impl Default for Disk {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<DiskMsg>(300);
        Self { tx, rx, torrents: HashMap::new() }
    }

    #[tracing::instrument(skip(self), name = "disk::run")]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("disk started event loop");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                DiskMsg::NewTorrent {
                    metadata,
                    download_dir,
                    events,
                    claimed,
                    recipient,
                } => {
                    info!("new_torrent {:?}", metadata.info_hash);
                    let r = self
                        .new_torrent(metadata, download_dir, events, claimed)
                        .await;
                    let _ = recipient.send(r);
                }
                DiskMsg::WriteBlock { info_hash, block } => {
                    if let Err(e) = self.write_block(&info_hash, block).await {
                        warn!("{info_hash:?} could not write block: {e}");
                        if let Some(torrent) = self.torrents.get(&info_hash) {
                            let _ =
                                torrent.events.send(DiskEvent::Error(e.to_string()));
                        }
                    }
                }
                DiskMsg::ReadBlock { info_hash, block_info, recipient } => {
                    let r = self.read_block(&info_hash, &block_info).await;
                    let _ = recipient.send(r);
                }
                DiskMsg::DropTorrent { info_hash, delete_files, recipient } => {
                    debug!("drop_torrent {info_hash:?} delete {delete_files}");
                    if let Some(torrent) = self.torrents.remove(&info_hash) {
                        if delete_files {
                            if let Err(e) = Self::delete_files(&torrent).await {
                                warn!("{info_hash:?} could not delete files: {e}");
                            }
                        }
                    }
                    let _ = recipient.send(());
                }
                DiskMsg::Quit => {
                    debug!("Quit");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Open a file given a path, creating it if it doesn't exist.
    pub async fn open_file(path: impl AsRef<Path>) -> Result<File, Error> {
        let path = path.as_ref();

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|_| Error::FileOpenError(path.display().to_string()))
    }

    /// Grow the file to `length` without writing to it, so the filesystem
    /// may keep the unwritten regions sparse. Filesystems that can't do that
    /// get the file filled with zeroes.
    async fn allocate(file: &mut File, length: u64) -> Result<(), Error> {
        let current = file.metadata().await?.len();
        if current >= length {
            return Ok(());
        }
        if file.set_len(length).await.is_ok() {
            return Ok(());
        }

        debug!("sparse allocation failed, filling with zeroes");
        let zeroes = vec![0u8; 64 * 1024];
        file.seek(SeekFrom::Start(current)).await?;
        let mut left = length - current;
        while left > 0 {
            let n = left.min(zeroes.len() as u64) as usize;
            file.write_all(&zeroes[..n]).await?;
            left -= n as u64;
        }
        file.flush().await?;
        Ok(())
    }

    /// Create the file tree of the torrent and check the pieces already on
    /// disk.
    #[tracing::instrument(skip_all, fields(info_hash = ?metadata.info_hash))]
    pub async fn new_torrent(
        &mut self,
        metadata: Arc<TorrentMetadata>,
        download_dir: PathBuf,
        events: UnboundedSender<DiskEvent>,
        claimed: Option<Bitfield>,
    ) -> Result<Bitfield, Error> {
        let info_hash = metadata.info_hash;
        let torrent = DiskTorrent {
            metadata: metadata.clone(),
            download_dir,
            events,
            buffers: HashMap::new(),
        };

        // files that were on disk before, pieces that live on other files
        // can't have been downloaded.
        let mut existed = vec![false; metadata.files.len()];

        for (i, entry) in metadata.files.iter().enumerate() {
            let path = torrent.file_path(i);
            existed[i] = tokio::fs::try_exists(&path).await.unwrap_or(false);

            if let Some(parent) = path.parent() {
                create_dir_all(parent).await.map_err(|_| {
                    Error::FolderOpenError(parent.display().to_string())
                })?;
            }
            let mut file = Self::open_file(&path).await?;
            Self::allocate(&mut file, entry.length).await?;
        }

        let mut verified = Bitfield::repeat(false, metadata.num_pieces());

        for piece in 0..metadata.num_pieces() {
            if let Some(claimed) = &claimed {
                if !claimed.get(piece).is_some_and(|b| *b) {
                    continue;
                }
            }
            let spans = file_spans(
                &metadata,
                metadata.piece_offset(piece),
                metadata.piece_size(piece) as u64,
            );
            if spans.iter().any(|s| !existed[s.file]) {
                continue;
            }
            let data = Self::read_spans(&torrent, &spans).await?;
            if Self::hash_matches(&metadata, piece, &data) {
                verified.set(piece, true);
            }
        }

        info!(
            "recheck found {} of {} pieces",
            verified.count_ones(),
            metadata.num_pieces()
        );

        self.torrents.insert(info_hash, torrent);
        Ok(verified)
    }

    fn hash_matches(metadata: &TorrentMetadata, piece: usize, data: &[u8]) -> bool {
        let hash = sha1_smol::Sha1::from(data).digest().bytes();
        metadata.piece_hashes.get(piece).is_some_and(|h| *h == hash)
    }

    async fn read_spans(
        torrent: &DiskTorrent,
        spans: &[FileSpan],
    ) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(spans.iter().map(|s| s.len as usize).sum());
        for span in spans {
            let mut file = Self::open_file(torrent.file_path(span.file)).await?;
            file.seek(SeekFrom::Start(span.offset)).await?;
            let start = buf.len();
            buf.resize(start + span.len as usize, 0);
            file.read_exact(&mut buf[start..]).await?;
        }
        Ok(buf)
    }

    async fn write_spans(
        torrent: &DiskTorrent,
        spans: &[FileSpan],
        data: &[u8],
    ) -> Result<(), Error> {
        let mut written = 0;
        for span in spans {
            let mut file = Self::open_file(torrent.file_path(span.file)).await?;
            file.seek(SeekFrom::Start(span.offset)).await?;
            let end = written + span.len as usize;
            file.write_all(&data[written..end]).await?;
            file.flush().await?;
            written = end;
        }
        Ok(())
    }

    pub async fn read_block(
        &self,
        info_hash: &InfoHash,
        block_info: &BlockInfo,
    ) -> Result<Vec<u8>, Error> {
        let torrent =
            self.torrents.get(info_hash).ok_or(Error::TorrentDoesNotExist)?;
        let metadata = &torrent.metadata;
        let index = block_info.index as usize;

        if index >= metadata.num_pieces()
            || !block_info.is_valid(metadata.piece_size(index))
        {
            return Err(Error::MessageResponse);
        }

        let offset = metadata.piece_offset(index) + block_info.begin as u64;
        let spans = file_spans(metadata, offset, block_info.len as u64);
        Self::read_spans(torrent, &spans).await
    }

    /// Buffer the block. When it completes its piece, the piece is hashed,
    /// written if the hash matches and discarded otherwise, and the torrent
    /// is told the outcome.
    #[tracing::instrument(skip(self, block), fields(index = block.index, begin = block.begin))]
    pub async fn write_block(
        &mut self,
        info_hash: &InfoHash,
        block: Block,
    ) -> Result<(), Error> {
        let torrent =
            self.torrents.get_mut(info_hash).ok_or(Error::TorrentDoesNotExist)?;
        let metadata = torrent.metadata.clone();
        let index = block.index;

        if index >= metadata.num_pieces() {
            return Err(Error::MessageResponse);
        }
        let piece_size = metadata.piece_size(index);
        let begin = block.begin as usize;
        let end = begin + block.block.len();
        if block.block.is_empty() || end > piece_size as usize {
            warn!("block out of the piece bounds");
            return Ok(());
        }

        let buffer = torrent
            .buffers
            .entry(index)
            .or_insert_with(|| PieceBuffer::new(piece_size));

        if !buffer.blocks.insert(block.begin) {
            debug!("duplicate block");
            return Ok(());
        }
        buffer.data[begin..end].copy_from_slice(&block.block);
        buffer.received += block.block.len();

        if buffer.received < piece_size as usize {
            return Ok(());
        }

        let Some(buffer) = torrent.buffers.remove(&index) else {
            return Ok(());
        };

        if !Self::hash_matches(&metadata, index, &buffer.data) {
            warn!("piece {index} is corrupted");
            let _ = torrent.events.send(DiskEvent::PieceHashMismatch(index));
            return Ok(());
        }

        let spans = file_spans(
            &metadata,
            metadata.piece_offset(index),
            piece_size as u64,
        );
        Self::write_spans(torrent, &spans, &buffer.data).await?;

        debug!("piece {index} is valid");
        let _ = torrent.events.send(DiskEvent::PieceVerified(index));

        Ok(())
    }

    /// Delete the files of the torrent and the directories that became
    /// empty.
    async fn delete_files(torrent: &DiskTorrent) -> Result<(), Error> {
        let mut dirs = Vec::new();
        for (i, entry) in torrent.metadata.files.iter().enumerate() {
            let path = torrent.file_path(i);
            match remove_file(&path).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let mut parent = entry.path.parent();
            while let Some(dir) = parent {
                if dir.as_os_str().is_empty() {
                    break;
                }
                dirs.push(torrent.download_dir.join(dir));
                parent = dir.parent();
            }
        }

        // deepest first, a directory with other files is left alone.
        dirs.sort_by(|a, b| {
            b.components().count().cmp(&a.components().count()).then(a.cmp(b))
        });
        dirs.dedup();
        for dir in dirs {
            let _ = remove_dir(&dir).await;
        }
        Ok(())
    }
}
