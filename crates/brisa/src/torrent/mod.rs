//! Torrent that is spawned by the Engine
//!
//! A torrent will manage multiple peers, peers can send messages to the torrent
//! using [`TorrentMsg`], and torrent can send messages to the Peers using
//! [`PeerMsg`].

mod assembler;
mod types;

// re-exports
pub use assembler::*;
pub use types::*;

use std::{
    collections::VecDeque, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    select, spawn,
    sync::{broadcast, mpsc, mpsc::error::TrySendError, oneshot},
    time::{interval, interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, PieceMap},
    disk::DiskMsg,
    engine::{EngineCtx, EngineEvent, SecurityEvent, SecurityEventKind},
    error::Error,
    extensions::core::BlockInfo,
    metainfo::TorrentMetadata,
    peer::{
        self,
        choke::{ChokeCandidate, Choker},
        Direction, PeerArgs, PeerCtx, PeerId, PeerMsg,
    },
    resume::ResumeData,
    scheduler::PieceScheduler,
};

/// Capacity of the inbox of a peer.
const PEER_CHANNEL_LEN: usize = 100;

/// Candidates are dialed at this interval, so a failing candidate is not
/// retried right away.
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Resume data of a downloading torrent is saved at this interval, if
/// something changed.
const RESUME_INTERVAL: Duration = Duration::from_secs(30);

type CheckResult = Result<Bitfield, Error>;

/// A connected peer, as seen by the torrent.
#[derive(Debug)]
struct PeerHandle {
    tx: mpsc::Sender<PeerMsg>,
    ctx: Arc<PeerCtx>,
    cancel: CancellationToken,
}

/// A peer that is connecting or handshaking.
#[derive(Debug)]
struct Connecting {
    tx: mpsc::Sender<PeerMsg>,
    direction: Direction,
    cancel: CancellationToken,
}

/// The torrent never waits on a peer, because peers wait on the torrent. A
/// message that does not fit in the inbox is dropped.
fn notify(tx: &mpsc::Sender<PeerMsg>, msg: PeerMsg) {
    match tx.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => {
            warn!("inbox of a peer is full, dropped {}", msg.name());
        }
        Err(TrySendError::Closed(msg)) => {
            debug!("peer is gone, dropped {}", msg.name());
        }
    }
}

/// What the engine gives to a new torrent.
#[derive(Debug)]
pub struct TorrentParams {
    pub info_hash: InfoHash,
    pub name: String,
    /// `None` for magnets.
    pub metadata: Option<Arc<TorrentMetadata>>,
    pub download_dir: PathBuf,
    pub engine: Arc<EngineCtx>,
    pub disk_tx: mpsc::Sender<DiskMsg>,
    pub events: broadcast::Sender<EngineEvent>,
}

/// A torrent session, drives the peers of a torrent and owns its pieces.
pub struct Torrent {
    pub info_hash: InfoHash,
    pub name: String,
    pub status: TorrentStatus,
    pub tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TorrentMsg>,
    download_dir: PathBuf,
    engine: Arc<EngineCtx>,
    disk_tx: mpsc::Sender<DiskMsg>,
    disk_events_tx: mpsc::UnboundedSender<DiskEvent>,
    disk_events_rx: mpsc::UnboundedReceiver<DiskEvent>,
    events: broadcast::Sender<EngineEvent>,
    metadata: Option<Arc<TorrentMetadata>>,
    /// Built once the files were checked.
    scheduler: Option<PieceScheduler>,
    assembler: MetadataAssembler,
    /// The check of the files on disk, while it runs.
    checking: Option<oneshot::Receiver<CheckResult>>,
    peers: HashMap<PeerId, PeerHandle>,
    connecting: HashMap<SocketAddr, Connecting>,
    /// Addresses to dial, failed ones go to the back.
    candidates: VecDeque<SocketAddr>,
    dht_nodes: HashSet<SocketAddr>,
    choker: Choker,
    /// Bytes transferred by peers that are gone.
    downloaded: u64,
    uploaded: u64,
    /// If there are verified pieces that are not in the resume data.
    resume_dirty: bool,
}

impl Torrent {
    pub fn new(params: TorrentParams) -> Self {
        let (tx, rx) = mpsc::channel::<TorrentMsg>(300);
        let (disk_events_tx, disk_events_rx) = mpsc::unbounded_channel();

        let status = if params.metadata.is_some() {
            TorrentStatus::Checking
        } else {
            TorrentStatus::DownloadingMetadata
        };

        Self {
            info_hash: params.info_hash,
            name: params.name,
            status,
            tx,
            rx,
            download_dir: params.download_dir,
            choker: Choker::new(params.engine.config.unchoke_slots),
            engine: params.engine,
            disk_tx: params.disk_tx,
            disk_events_tx,
            disk_events_rx,
            events: params.events,
            metadata: params.metadata,
            scheduler: None,
            assembler: MetadataAssembler::new(params.info_hash),
            checking: None,
            peers: HashMap::new(),
            connecting: HashMap::new(),
            candidates: VecDeque::new(),
            dht_nodes: HashSet::new(),
            downloaded: 0,
            uploaded: 0,
            resume_dirty: false,
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn security(&self, kind: SecurityEventKind, message: String) {
        self.emit(EngineEvent::Security(SecurityEvent::new(kind, message)));
    }

    fn set_status(&mut self, status: TorrentStatus) {
        if self.status == status {
            return;
        }
        info!("{:?} {} -> {}", self.info_hash, self.status, status);
        self.status = status;
        self.emit(EngineEvent::TorrentStateChanged { id: self.info_hash, status });
    }

    /// The status the torrent goes to when it is running.
    fn running_status(&self) -> TorrentStatus {
        if self.metadata.is_none() {
            TorrentStatus::DownloadingMetadata
        } else if self.checking.is_some() || self.scheduler.is_none() {
            TorrentStatus::Checking
        } else if self.scheduler.as_ref().is_some_and(|s| s.is_complete()) {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        }
    }

    /// Start the event loop of the torrent.
    #[tracing::instrument(name = "torrent", skip_all, fields(info_hash = ?self.info_hash))]
    pub async fn run(&mut self) -> Result<(), Error> {
        if self.metadata.is_some() {
            self.start_check().await?;
        }

        let mut rates_interval = interval(Duration::from_secs(1));
        let mut connect_interval = interval(CONNECT_INTERVAL);
        let mut choke_interval =
            interval_at(Instant::now() + Choker::INTERVAL, Choker::INTERVAL);
        let mut resume_interval =
            interval_at(Instant::now() + RESUME_INTERVAL, RESUME_INTERVAL);

        for i in [
            &mut rates_interval,
            &mut connect_interval,
            &mut choke_interval,
            &mut resume_interval,
        ] {
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    match msg {
                        TorrentMsg::Remove { delete_files, recipient } => {
                            self.remove(delete_files).await;
                            let _ = recipient.send(());
                            return Ok(());
                        }
                        TorrentMsg::Shutdown(recipient) => {
                            self.quit_peers();
                            self.save_resume().await;
                            let _ = recipient.send(());
                            return Ok(());
                        }
                        msg => self.handle_msg(msg).await?,
                    }
                }
                Some(event) = self.disk_events_rx.recv() => {
                    self.handle_disk_event(event);
                }
                checked = recv_check(&mut self.checking) => {
                    self.checking = None;
                    self.check_done(checked.map_err(Error::from).and_then(|r| r));
                }
                _ = rates_interval.tick() => {
                    for peer in self.peers.values() {
                        peer.ctx.counter.update_rates().await;
                    }
                }
                _ = connect_interval.tick() => {
                    self.connect_peers().await;
                }
                _ = choke_interval.tick() => {
                    self.choke_round();
                }
                _ = resume_interval.tick() => {
                    if self.resume_dirty && self.status == TorrentStatus::Downloading {
                        self.save_resume().await;
                    }
                }
            }
        }
    }

    /// Send the torrent to the disk, which creates the files and hashes the
    /// pieces already on disk.
    async fn start_check(&mut self) -> Result<(), Error> {
        let Some(metadata) = self.metadata.clone() else {
            return Ok(());
        };

        // with valid resume data, only the pieces that it claims are hashed.
        let claimed = match ResumeData::load(&self.engine.config.resume_dir, &self.info_hash).await {
            Ok(Some(data)) if data.matches_layout(&metadata, &self.download_dir).await => {
                match data.verified() {
                    Ok(claimed) => {
                        debug!("fast resume with {} pieces", claimed.count_ones());
                        Some(claimed)
                    }
                    Err(_) => None,
                }
            }
            Ok(_) => None,
            Err(e) => {
                warn!("ignoring resume data: {e}");
                None
            }
        };

        let (otx, orx) = oneshot::channel();
        self.disk_tx
            .send(DiskMsg::NewTorrent {
                metadata,
                download_dir: self.download_dir.clone(),
                events: self.disk_events_tx.clone(),
                claimed,
                recipient: otx,
            })
            .await?;

        self.checking = Some(orx);
        if self.status != TorrentStatus::Paused {
            self.set_status(TorrentStatus::Checking);
        }
        Ok(())
    }

    fn check_done(&mut self, result: CheckResult) {
        let Some(metadata) = self.metadata.clone() else { return };

        let verified = match result {
            Ok(verified) => verified,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };

        let num_pieces = metadata.num_pieces();
        let pieces = PieceMap::from_verified(&verified, num_pieces);
        self.security(
            SecurityEventKind::HashVerify,
            format!(
                "{}: {} of {num_pieces} pieces verified on disk",
                self.name,
                pieces.verified_count()
            ),
        );
        self.scheduler = Some(PieceScheduler::new(metadata.clone(), pieces));

        let inboxes = self
            .peers
            .values()
            .map(|p| &p.tx)
            .chain(self.connecting.values().map(|c| &c.tx));
        for tx in inboxes {
            notify(tx, PeerMsg::HaveInfo(metadata.clone(), verified.clone()));
        }

        if self.status != TorrentStatus::Paused {
            self.set_status(self.running_status());
        }
        if self.status == TorrentStatus::Seeding {
            self.emit(EngineEvent::TorrentFinished(self.info_hash));
        }
    }

    /// An unrecoverable disk error, the torrent stays visible but inactive.
    fn fail(&mut self, message: String) {
        warn!("{:?} error: {message}", self.info_hash);
        self.quit_peers();
        self.set_status(TorrentStatus::Error);
        self.emit(EngineEvent::TorrentError { id: self.info_hash, message: message.clone() });
        self.security(SecurityEventKind::Error, format!("{}: {message}", self.name));
    }

    fn can_connect(&self) -> bool {
        matches!(
            self.status,
            TorrentStatus::DownloadingMetadata
                | TorrentStatus::Downloading
                | TorrentStatus::Seeding
        ) && self.peers.len() + self.connecting.len()
            < self.engine.config.max_torrent_peers
    }

    fn peer_args(&self, cancel: CancellationToken) -> PeerArgs {
        let local_pieces = self
            .scheduler
            .as_ref()
            .map(|s| s.bitfield())
            .unwrap_or_default();
        PeerArgs {
            info_hash: self.info_hash,
            torrent_tx: self.tx.clone(),
            disk_tx: self.disk_tx.clone(),
            engine: self.engine.clone(),
            // peers learn about the metadata once the check is done
            metadata: self.scheduler.as_ref().and(self.metadata.clone()),
            local_pieces,
            cancel,
        }
    }

    /// Dial candidates until the peer limits are reached.
    async fn connect_peers(&mut self) {
        while self.can_connect() {
            let Some(addr) = self.candidates.pop_front() else { break };

            if self.engine.is_blocked(addr.ip()).await {
                debug!("{addr} is blocked");
                continue;
            }
            if !self.engine.reserve_peer() {
                self.candidates.push_front(addr);
                break;
            }

            debug!("connecting to {addr}");
            let (tx, rx) = mpsc::channel(PEER_CHANNEL_LEN);
            let cancel = CancellationToken::new();
            spawn(peer::run_outbound(addr, self.peer_args(cancel.clone()), rx));
            self.connecting.insert(
                addr,
                Connecting { tx, direction: Direction::Outbound, cancel },
            );
        }
    }

    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<(), Error> {
        match msg {
            TorrentMsg::AddPeers(addrs) => {
                for addr in addrs {
                    let known = self.connecting.contains_key(&addr)
                        || self.candidates.contains(&addr)
                        || self.peers.values().any(|p| p.ctx.remote_addr == addr);
                    if !known {
                        self.candidates.push_back(addr);
                    }
                }
                self.connect_peers().await;
            }
            TorrentMsg::IncomingPeer(inbound) => {
                let addr = inbound.remote_addr;
                if !self.can_connect() || !self.engine.reserve_peer() {
                    debug!("{addr} refused, no peer slots");
                    return Ok(());
                }
                let (tx, rx) = mpsc::channel(PEER_CHANNEL_LEN);
                let cancel = CancellationToken::new();
                spawn(peer::run_inbound(*inbound, self.peer_args(cancel.clone()), rx));
                self.connecting.insert(
                    addr,
                    Connecting { tx, direction: Direction::Inbound, cancel },
                );
            }
            TorrentMsg::PeerConnectFailed(addr) => {
                if let Some(connecting) = self.connecting.remove(&addr) {
                    self.engine.release_peer();
                    if connecting.direction == Direction::Outbound {
                        self.candidates.push_back(addr);
                    }
                }
            }
            TorrentMsg::PeerConnected(ctx) => {
                let Some(connecting) = self.connecting.remove(&ctx.remote_addr) else {
                    return Ok(());
                };
                if self.peers.contains_key(&ctx.id) {
                    debug!("{} is already connected", ctx.remote_addr);
                    connecting.cancel.cancel();
                    return Ok(());
                }
                info!("connected to {} {:?}", ctx.remote_addr, ctx.direction);
                let Connecting { tx, cancel, .. } = connecting;
                self.peers.insert(ctx.id.clone(), PeerHandle { tx, ctx, cancel });
            }
            TorrentMsg::PeerDisconnected(id, addr) => {
                self.engine.release_peer();
                if !self.peers.get(&id).is_some_and(|p| p.ctx.remote_addr == addr) {
                    return Ok(());
                }
                if let Some(peer) = self.peers.remove(&id) {
                    debug!("{addr} disconnected");
                    self.downloaded += peer.ctx.counter.total_downloaded();
                    self.uploaded += peer.ctx.counter.total_uploaded();
                }
                if let Some(scheduler) = &mut self.scheduler {
                    scheduler.peer_disconnected(&id);
                }
                self.assembler.peer_disconnected(&id);
                self.notify_request_blocks();
                self.connect_peers().await;
            }
            TorrentMsg::PeerBitfield(id, bitfield) => {
                if let Some(scheduler) = &mut self.scheduler {
                    scheduler.peer_bitfield(&id, bitfield);
                }
            }
            TorrentMsg::PeerHave(id, piece) => {
                if let Some(scheduler) = &mut self.scheduler {
                    scheduler.peer_have(&id, piece);
                }
            }
            TorrentMsg::PeerInterested(id) => {
                let unchoked = self.peers.values().filter(|p| !p.ctx.am_choking()).count();
                if self.status.is_active() && unchoked < self.engine.config.unchoke_slots {
                    if let Some(peer) = self.peers.get(&id) {
                        notify(&peer.tx, PeerMsg::Unchoke);
                    }
                }
            }
            TorrentMsg::RequestBlocks { peer_id, qnt, recipient } => {
                let blocks = match &mut self.scheduler {
                    Some(scheduler) if self.status == TorrentStatus::Downloading => {
                        scheduler.pick_blocks(&peer_id, qnt)
                    }
                    _ => Vec::new(),
                };
                let _ = recipient.send(blocks);
            }
            TorrentMsg::BlockReceived(id, block) => {
                let Some(scheduler) = &mut self.scheduler else {
                    return Ok(());
                };
                let block_info = BlockInfo::from(&block);
                let Some(duplicates) = scheduler.block_received(&id, &block_info) else {
                    debug!("dropping block {block_info:?}");
                    return Ok(());
                };
                for dup in duplicates {
                    if let Some(peer) = self.peers.get(&dup) {
                        notify(&peer.tx, PeerMsg::CancelBlock(block_info));
                    }
                }
                self.disk_tx
                    .send(DiskMsg::WriteBlock { info_hash: self.info_hash, block })
                    .await?;
            }
            TorrentMsg::ReleaseBlocks(id, blocks) => {
                if let Some(scheduler) = &mut self.scheduler {
                    scheduler.release(&id, &blocks);
                }
                self.notify_request_blocks();
            }
            TorrentMsg::MetadataSize(id, size) => {
                if self.metadata.is_none() {
                    self.assembler.set_size(&id, size);
                }
            }
            TorrentMsg::RequestMetadataPiece(id, recipient) => {
                let piece = if self.metadata.is_none()
                    && self.status == TorrentStatus::DownloadingMetadata
                {
                    self.assembler.next_request(&id)
                } else {
                    None
                };
                let _ = recipient.send(piece);
            }
            TorrentMsg::MetadataPiece(_, piece, payload) => {
                if self.metadata.is_none() {
                    self.metadata_piece(piece, payload).await?;
                }
            }
            TorrentMsg::MetadataReject(_, piece) => {
                self.assembler.release(piece);
            }
            TorrentMsg::DhtPort(addr) => {
                self.dht_nodes.insert(addr);
            }
            TorrentMsg::BlockIp(ip) => {
                self.candidates.retain(|addr| addr.ip() != ip);
                for peer in self.peers.values() {
                    if peer.ctx.remote_addr.ip() == ip {
                        peer.cancel.cancel();
                    }
                }
                for (addr, connecting) in &self.connecting {
                    if addr.ip() == ip {
                        connecting.cancel.cancel();
                    }
                }
            }
            TorrentMsg::GetSnapshot(recipient) => {
                let _ = recipient.send(self.snapshot());
            }
            TorrentMsg::Pause => {
                if self.status.is_active() {
                    self.quit_peers();
                    self.set_status(TorrentStatus::Paused);
                    self.save_resume().await;
                }
            }
            TorrentMsg::Resume => match self.status {
                TorrentStatus::Paused => {
                    self.set_status(self.running_status());
                    self.connect_peers().await;
                }
                // the files are checked again, the pieces that survived
                // are kept.
                TorrentStatus::Error => {
                    info!("{:?} restarting after an error", self.info_hash);
                    self.scheduler = None;
                    if self.metadata.is_none() {
                        self.set_status(TorrentStatus::DownloadingMetadata);
                    } else if let Err(e) = self.start_check().await {
                        self.fail(e.to_string());
                    }
                }
                _ => {}
            },
            TorrentMsg::Remove { .. } | TorrentMsg::Shutdown(_) => {}
        }
        Ok(())
    }

    async fn metadata_piece(&mut self, piece: u32, payload: Vec<u8>) -> Result<(), Error> {
        let info = match self.assembler.receive(piece, payload) {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(()),
            Err(Error::PieceInvalid) => {
                self.security(
                    SecurityEventKind::Error,
                    format!("{}: received metadata does not match the info hash", self.name),
                );
                return Ok(());
            }
            Err(e) => {
                debug!("metadata piece {piece}: {e}");
                return Ok(());
            }
        };

        let metadata = match TorrentMetadata::from_info_bytes(&info) {
            Ok(metadata) => Arc::new(metadata),
            Err(e) => {
                self.fail(format!("invalid metadata: {e}"));
                return Ok(());
            }
        };

        info!("received the metadata of {}", metadata.name);
        self.name = metadata.name.clone();
        self.metadata = Some(metadata);
        self.emit(EngineEvent::MetadataReceived { id: self.info_hash, name: self.name.clone() });

        self.start_check().await
    }

    fn handle_disk_event(&mut self, event: DiskEvent) {
        if !self.status.is_active() && self.status != TorrentStatus::Paused {
            return;
        }
        let Some(scheduler) = &mut self.scheduler else { return };

        match event {
            DiskEvent::PieceVerified(piece) => {
                if !scheduler.piece_verified(piece) {
                    return;
                }
                self.resume_dirty = true;
                let complete = scheduler.is_complete();

                for peer in self.peers.values() {
                    notify(&peer.tx, PeerMsg::HavePiece(piece));
                }

                if complete {
                    info!("{} finished downloading", self.name);
                    let pieces = self.metadata.as_ref().map(|m| m.num_pieces()).unwrap_or_default();
                    self.security(
                        SecurityEventKind::HashVerify,
                        format!("{}: all {pieces} pieces verified", self.name),
                    );
                    if self.status != TorrentStatus::Paused {
                        self.set_status(TorrentStatus::Seeding);
                    }
                    self.emit(EngineEvent::TorrentFinished(self.info_hash));
                } else {
                    self.notify_request_blocks();
                }
            }
            DiskEvent::PieceHashMismatch(piece) => {
                scheduler.piece_failed(piece);
                self.security(
                    SecurityEventKind::HashMismatch,
                    format!("{}: piece {piece} failed the hash check", self.name),
                );
                self.notify_request_blocks();
            }
            DiskEvent::Error(message) => self.fail(message),
        }
    }

    /// Tell the peers that there may be blocks for them.
    fn notify_request_blocks(&self) {
        if self.status != TorrentStatus::Downloading {
            return;
        }
        for peer in self.peers.values() {
            if !peer.ctx.peer_choking() && peer.ctx.am_interested() {
                notify(&peer.tx, PeerMsg::RequestBlocks);
            }
        }
    }

    /// Run the choke algorithm. Every peer is told its state each round, so a
    /// dropped message is corrected on the next one.
    fn choke_round(&mut self) {
        if !self.status.is_active() {
            return;
        }
        let seeding = self.status == TorrentStatus::Seeding;
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .values()
            .map(|p| ChokeCandidate {
                id: p.ctx.id.clone(),
                rate: if seeding {
                    p.ctx.counter.upload_rate()
                } else {
                    p.ctx.counter.download_rate()
                },
                interested: p.ctx.peer_interested(),
            })
            .collect();

        let unchoked = self.choker.run(&candidates);

        for (id, peer) in &self.peers {
            let msg = if unchoked.contains(id) { PeerMsg::Unchoke } else { PeerMsg::Choke };
            notify(&peer.tx, msg);
        }
    }

    /// Close every connection. Peers report back with
    /// [`TorrentMsg::PeerDisconnected`] or [`TorrentMsg::PeerConnectFailed`].
    fn quit_peers(&mut self) {
        for peer in self.peers.values() {
            peer.cancel.cancel();
        }
        for connecting in self.connecting.values() {
            connecting.cancel.cancel();
        }
    }

    async fn save_resume(&mut self) {
        let (Some(metadata), Some(scheduler)) = (&self.metadata, &self.scheduler) else {
            return;
        };
        let data = ResumeData::new(metadata, &self.download_dir, &scheduler.bitfield());
        match data.save(&self.engine.config.resume_dir).await {
            Ok(()) => self.resume_dirty = false,
            Err(e) => warn!("could not save resume data: {e}"),
        }
    }

    /// Stop every peer and drop the torrent from the disk. Nothing of the
    /// torrent touches the disk after this returns.
    async fn remove(&mut self, delete_files: bool) {
        self.quit_peers();
        self.checking = None;

        let (otx, orx) = oneshot::channel();
        let msg = DiskMsg::DropTorrent { info_hash: self.info_hash, delete_files, recipient: otx };
        if self.disk_tx.send(msg).await.is_ok() {
            let _ = orx.await;
        }

        let resume_dir = &self.engine.config.resume_dir;
        if delete_files {
            if let Err(e) = ResumeData::delete(resume_dir, &self.info_hash).await {
                warn!("could not delete resume data: {e}");
            }
        } else {
            self.save_resume().await;
        }

        self.status = TorrentStatus::Removed;
    }

    pub fn snapshot(&self) -> TorrentSnapshot {
        let mut snapshot = TorrentSnapshot {
            id: self.info_hash,
            name: self.name.clone(),
            status: self.status,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            dht_nodes: self.dht_nodes.len(),
            ..Default::default()
        };

        for peer in self.peers.values() {
            let counter = &peer.ctx.counter;
            snapshot.download_rate += counter.download_rate();
            snapshot.upload_rate += counter.upload_rate();
            snapshot.downloaded += counter.total_downloaded();
            snapshot.uploaded += counter.total_uploaded();
            if peer.ctx.is_seed() {
                snapshot.seeds += 1;
            } else {
                snapshot.peers += 1;
            }
        }

        if let Some(metadata) = &self.metadata {
            snapshot.size = metadata.total_size;
            snapshot.total_pieces = metadata.num_pieces();
        }

        if let Some(scheduler) = &self.scheduler {
            snapshot.verified_pieces = scheduler.pieces().verified_count();
            snapshot.completed = scheduler.is_complete();
            if snapshot.size > 0 {
                snapshot.progress =
                    scheduler.verified_bytes() as f64 / snapshot.size as f64;
            }
        }

        snapshot
    }
}

/// Wait for the check of the files, or forever if it is not running.
async fn recv_check(
    checking: &mut Option<oneshot::Receiver<CheckResult>>,
) -> Result<CheckResult, oneshot::error::RecvError> {
    match checking {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, disk::Disk, scheduler::tests::metadata};

    fn torrent(metadata: Option<Arc<TorrentMetadata>>) -> (Torrent, broadcast::Receiver<EngineEvent>) {
        let config = Config {
            resume_dir: std::env::temp_dir().join("brisa-torrent-tests"),
            ..Default::default()
        };
        let engine = Arc::new(EngineCtx::new(config));
        let (events, events_rx) = broadcast::channel(64);
        let disk = Disk::new();
        let info_hash = metadata.as_ref().map(|m| m.info_hash).unwrap_or_default();
        let torrent = Torrent::new(TorrentParams {
            info_hash,
            name: "test".into(),
            metadata,
            download_dir: std::env::temp_dir(),
            engine,
            disk_tx: disk.tx.clone(),
            events,
        });
        (torrent, events_rx)
    }

    #[test]
    fn magnet_starts_downloading_metadata() {
        let (torrent, _) = torrent(None);
        assert_eq!(torrent.status, TorrentStatus::DownloadingMetadata);
        assert_eq!(torrent.running_status(), TorrentStatus::DownloadingMetadata);
        let snapshot = torrent.snapshot();
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.size, 0);
    }

    #[test]
    fn hash_mismatch_emits_one_event() {
        let metadata = metadata(4, 16);
        let (mut torrent, mut events) = torrent(Some(metadata.clone()));
        torrent.check_done(Ok(Bitfield::repeat(false, 4)));
        assert_eq!(torrent.status, TorrentStatus::Downloading);

        torrent.handle_disk_event(DiskEvent::PieceHashMismatch(2));

        let mut mismatches = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Security(e) = event {
                if e.kind == SecurityEventKind::HashMismatch {
                    mismatches += 1;
                }
            }
        }
        assert_eq!(mismatches, 1);
        assert!(torrent.scheduler.as_ref().unwrap().pieces().is_missing(2));
    }

    #[test]
    fn finishes_when_every_piece_is_verified() {
        let metadata = metadata(2, 16);
        let (mut torrent, mut events) = torrent(Some(metadata));
        torrent.check_done(Ok(Bitfield::repeat(false, 2)));

        torrent.handle_disk_event(DiskEvent::PieceVerified(0));
        assert_eq!(torrent.status, TorrentStatus::Downloading);
        torrent.handle_disk_event(DiskEvent::PieceVerified(1));
        assert_eq!(torrent.status, TorrentStatus::Seeding);

        let snapshot = torrent.snapshot();
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.verified_pieces, 2);

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= matches!(event, EngineEvent::TorrentFinished(_));
        }
        assert!(finished);
    }

    #[test]
    fn disk_error_moves_to_error() {
        let (mut torrent, _) = torrent(Some(metadata(2, 16)));
        torrent.check_done(Err(Error::FileOpenError("/nope".into())));
        assert_eq!(torrent.status, TorrentStatus::Error);
        assert!(!torrent.can_connect());
    }

    #[tokio::test]
    async fn resume_after_an_error_checks_again() {
        let (mut torrent, _) = torrent(Some(metadata(2, 16)));
        let (disk_tx, mut disk_rx) = mpsc::channel(8);
        torrent.disk_tx = disk_tx;

        torrent.check_done(Ok(Bitfield::repeat(false, 2)));
        torrent.handle_disk_event(DiskEvent::Error("disk full".into()));
        assert_eq!(torrent.status, TorrentStatus::Error);

        // pause does nothing to a failed torrent
        torrent.handle_msg(TorrentMsg::Pause).await.unwrap();
        assert_eq!(torrent.status, TorrentStatus::Error);

        torrent.handle_msg(TorrentMsg::Resume).await.unwrap();
        assert_eq!(torrent.status, TorrentStatus::Checking);
        assert!(torrent.checking.is_some());
        assert!(torrent.scheduler.is_none());
        assert!(matches!(disk_rx.try_recv(), Ok(DiskMsg::NewTorrent { .. })));

        torrent.checking = None;
        torrent.check_done(Ok(Bitfield::repeat(false, 2)));
        assert_eq!(torrent.status, TorrentStatus::Downloading);
        assert!(torrent.can_connect());
    }

    fn peer_handle(addr: &str, id: u8) -> (PeerHandle, mpsc::Receiver<PeerMsg>) {
        let (tx, rx) = mpsc::channel(1);
        // the inbox is full
        tx.try_send(PeerMsg::RequestBlocks).unwrap();
        let ctx = Arc::new(PeerCtx::new(
            PeerId([id; 20]),
            addr.parse().unwrap(),
            Direction::Outbound,
            false,
        ));
        (PeerHandle { tx, ctx, cancel: CancellationToken::new() }, rx)
    }

    #[tokio::test]
    async fn full_inboxes_do_not_stop_quits() {
        let (mut torrent, _) = torrent(Some(metadata(2, 16)));
        torrent.check_done(Ok(Bitfield::repeat(false, 2)));

        let (a, _a_rx) = peer_handle("10.0.0.1:6881", 1);
        let (b, _b_rx) = peer_handle("10.0.0.2:6881", 2);
        let (a_cancel, b_cancel) = (a.cancel.clone(), b.cancel.clone());
        torrent.peers.insert(a.ctx.id.clone(), a);
        torrent.peers.insert(b.ctx.id.clone(), b);

        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(PeerMsg::RequestBlocks).unwrap();
        let connecting = CancellationToken::new();
        torrent.connecting.insert(
            "10.0.0.3:6881".parse().unwrap(),
            Connecting { tx, direction: Direction::Outbound, cancel: connecting.clone() },
        );

        // a choke round drops the messages that do not fit
        torrent.choke_round();

        torrent.handle_msg(TorrentMsg::BlockIp("10.0.0.1".parse().unwrap())).await.unwrap();
        assert!(a_cancel.is_cancelled());
        assert!(!b_cancel.is_cancelled());
        assert!(!connecting.is_cancelled());

        torrent.handle_msg(TorrentMsg::Pause).await.unwrap();
        assert_eq!(torrent.status, TorrentStatus::Paused);
        assert!(b_cancel.is_cancelled());
        assert!(connecting.is_cancelled());
    }
}
