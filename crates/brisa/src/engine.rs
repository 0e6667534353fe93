//! The engine is the most high-level API of the library.
//! It owns the [`Disk`] and the [`Torrent`]s, which own the peers.
//!
//! Consumers talk to the engine with an [`EngineHandle`], and receive
//! [`EngineEvent`]s from a broadcast channel: snapshots at a steady
//! interval, and discrete events as they happen.
use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{
    fs::create_dir_all,
    net::TcpListener,
    select, spawn,
    sync::{broadcast, mpsc, oneshot, RwLock},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    disk::{Disk, DiskMsg},
    encryption::EncryptionPolicy,
    error::Error,
    ip_filter::{parse_ip, IpFilter},
    magnet::Magnet,
    metainfo::TorrentMetadata,
    peer::{self, InboundPeer, PeerId},
    proxy::{ProxyConfig, ProxyKind},
    rate_limiter::RateLimiter,
    torrent::{
        InfoHash, Torrent, TorrentId, TorrentMsg, TorrentParams,
        TorrentSnapshot, TorrentStatus,
    },
};

/// The security log keeps at most this many events...
const SECURITY_LOG_MAX: usize = 1000;
/// ...and is trimmed to the newest this many when it goes over.
const SECURITY_LOG_TRIM: usize = 500;

/// State of the engine that is shared with the torrents and peers.
#[derive(Debug)]
pub struct EngineCtx {
    pub config: Config,
    local_peer_id: PeerId,
    anonymous_peer_id: PeerId,
    encryption: AtomicU8,
    dht: AtomicBool,
    anonymous: AtomicBool,
    pub proxy: RwLock<Option<ProxyConfig>>,
    pub ip_filter: RwLock<IpFilter>,
    pub rate_limiter: RateLimiter,
    listen_port: AtomicU16,
    /// Connections of every torrent, connecting or connected.
    peers: AtomicUsize,
    /// Torrents of the engine, an encrypted handshake only tells the torrent
    /// by a hash of its info hash.
    pub info_hashes: RwLock<Vec<InfoHash>>,
}

impl EngineCtx {
    pub fn new(config: Config) -> Self {
        let ip_filter = if config.block_reserved_ranges {
            IpFilter::with_reserved_ranges()
        } else {
            IpFilter::default()
        };

        Self {
            local_peer_id: PeerId::generate(),
            anonymous_peer_id: PeerId::anonymous(),
            encryption: AtomicU8::new(config.encryption.into()),
            dht: AtomicBool::new(config.dht_enabled),
            anonymous: AtomicBool::new(config.anonymous_mode),
            proxy: RwLock::new(None),
            ip_filter: RwLock::new(ip_filter),
            rate_limiter: RateLimiter::new(config.upload_limit, config.download_limit),
            listen_port: AtomicU16::new(config.listen_addr.port()),
            peers: AtomicUsize::new(0),
            info_hashes: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Our peer id, which does not carry the client prefix in anonymous
    /// mode.
    pub fn peer_id(&self) -> PeerId {
        if self.anonymous() {
            self.anonymous_peer_id.clone()
        } else {
            self.local_peer_id.clone()
        }
    }

    pub fn encryption_policy(&self) -> EncryptionPolicy {
        self.encryption.load(Ordering::Relaxed).into()
    }

    pub fn dht_enabled(&self) -> bool {
        self.dht.load(Ordering::Relaxed)
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous.load(Ordering::Relaxed)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        self.ip_filter.read().await.is_blocked(ip)
    }

    /// Take a slot of the global peer limit. Returns false if there is
    /// none left.
    pub fn reserve_peer(&self) -> bool {
        let max = self.config.max_global_peers;
        self.peers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn release_peer(&self) {
        let _ = self.peers.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        });
    }

    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }
}

/// Kinds of security and integrity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    /// A piece did not match its hash and will be downloaded again.
    HashMismatch,
    /// Pieces were verified, after a check of the files or on completion.
    HashVerify,
    IpBlock,
    Encryption,
    Dht,
    Error,
    Shutdown,
    IpFilter,
}

impl Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SecurityEventKind::*;
        let s = match self {
            HashMismatch => "HASH_MISMATCH",
            HashVerify => "HASH_VERIFY",
            IpBlock => "IP_BLOCK",
            Encryption => "ENCRYPTION",
            Dht => "DHT",
            Error => "ERROR",
            Shutdown => "SHUTDOWN",
            IpFilter => "IP_FILTER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub message: String,
    pub time: OffsetDateTime,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, message: String) -> Self {
        Self { kind, message, time: OffsetDateTime::now_utc() }
    }
}

/// Security events of the engine, oldest first.
#[derive(Debug, Default)]
pub struct SecurityLog(Vec<SecurityEvent>);

impl SecurityLog {
    pub fn push(&mut self, event: SecurityEvent) {
        self.0.push(event);
        if self.0.len() > SECURITY_LOG_MAX {
            let excess = self.0.len() - SECURITY_LOG_TRIM;
            self.0.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The newest `n` events, oldest first.
    pub fn last(&self, n: usize) -> Vec<SecurityEvent> {
        let start = self.0.len().saturating_sub(n);
        self.0[start..].to_vec()
    }
}

/// Security settings of the engine and the size of its log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityStats {
    /// The policy is not [`EncryptionPolicy::Disabled`].
    pub encryption_enabled: bool,
    pub dht_enabled: bool,
    /// Addresses blocked with [`EngineHandle::block_ip`].
    pub blocked_ips_count: usize,
    pub security_events_count: usize,
}

/// Everything that the engine tells its consumers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TorrentAdded { id: TorrentId, name: String },
    /// Every piece of the torrent is verified.
    TorrentFinished(TorrentId),
    TorrentRemoved(TorrentId),
    /// The torrent moved to the error state.
    TorrentError { id: TorrentId, message: String },
    /// The info of a magnet torrent was downloaded.
    MetadataReceived { id: TorrentId, name: String },
    TorrentStateChanged { id: TorrentId, status: TorrentStatus },
    Security(SecurityEvent),
    /// Sent at the snapshot interval.
    Snapshot(Vec<TorrentSnapshot>),
}

/// Aggregated state of every torrent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub torrents: usize,
    pub active_torrents: usize,
    pub peers: usize,
    pub dht_nodes: usize,
}

/// Messages used to control the [`Engine`], most of them are sent by the
/// [`EngineHandle`].
#[derive(Debug)]
pub enum EngineMsg {
    AddTorrent {
        bytes: Vec<u8>,
        /// `None` is the download dir of the config.
        download_dir: Option<PathBuf>,
        recipient: oneshot::Sender<Result<TorrentId, Error>>,
    },
    AddMagnet {
        uri: String,
        download_dir: Option<PathBuf>,
        recipient: oneshot::Sender<Result<TorrentId, Error>>,
    },
    AddPeers {
        id: TorrentId,
        peers: Vec<SocketAddr>,
        recipient: oneshot::Sender<Result<(), Error>>,
    },
    Pause(TorrentId, oneshot::Sender<Result<(), Error>>),
    Resume(TorrentId, oneshot::Sender<Result<(), Error>>),
    Remove {
        id: TorrentId,
        delete_files: bool,
        recipient: oneshot::Sender<Result<(), Error>>,
    },
    SetUploadLimit(u64),
    SetDownloadLimit(u64),
    SetEncryptionPolicy(EncryptionPolicy),
    SetDhtEnabled(bool),
    SetAnonymousMode(bool),
    /// `None` disables the proxy.
    SetProxy(Option<ProxyConfig>),
    BlockIp(String, oneshot::Sender<Result<(), Error>>),
    Snapshot(oneshot::Sender<Vec<TorrentSnapshot>>),
    SessionStats(oneshot::Sender<SessionStats>),
    SecurityLog {
        last_n: usize,
        recipient: oneshot::Sender<Vec<SecurityEvent>>,
    },
    SecurityStats(oneshot::Sender<SecurityStats>),
    AllTorrentsCompleted(oneshot::Sender<bool>),
    ActiveTorrentCount(oneshot::Sender<usize>),
    /// A peer connected to us and sent a handshake.
    IncomingPeer(Box<InboundPeer>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
struct TorrentHandle {
    tx: mpsc::Sender<TorrentMsg>,
    name: String,
}

pub struct Engine {
    ctx: Arc<EngineCtx>,
    rx: mpsc::Receiver<EngineMsg>,
    disk_tx: mpsc::Sender<DiskMsg>,
    torrents: HashMap<TorrentId, TorrentHandle>,
    events: broadcast::Sender<EngineEvent>,
    /// The engine listens to its own events to keep the security log.
    events_rx: broadcast::Receiver<EngineEvent>,
    security_log: SecurityLog,
    accept_handle: JoinHandle<()>,
}

impl Engine {
    /// Bind the listen address, create the directories and start the
    /// engine, the disk and the accept loop.
    ///
    /// Failing to create the directories is the only fatal error of the
    /// engine.
    pub async fn start(config: Config) -> Result<EngineHandle, Error> {
        for dir in [&config.download_dir, &config.resume_dir] {
            create_dir_all(dir)
                .await
                .map_err(|_| Error::FolderOpenError(dir.display().to_string()))?;
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(EngineCtx::new(config));
        ctx.listen_port.store(local_addr.port(), Ordering::Relaxed);

        info!("listening on {local_addr}");

        let mut disk = Disk::new();
        let disk_tx = disk.tx.clone();
        spawn(async move {
            if let Err(e) = disk.run().await {
                warn!("disk stopped: {e}");
            }
        });

        let (tx, rx) = mpsc::channel::<EngineMsg>(300);
        let (events, events_rx) = broadcast::channel(1024);

        let accept_handle = spawn(accept_loop(listener, ctx.clone(), tx.clone()));

        let mut engine = Self {
            ctx: ctx.clone(),
            rx,
            disk_tx,
            torrents: HashMap::new(),
            events: events.clone(),
            events_rx,
            security_log: SecurityLog::default(),
            accept_handle,
        };

        let rules = ctx.ip_filter.read().await.len();
        engine.security(
            SecurityEventKind::IpFilter,
            format!("IP filter loaded with {rules} rules"),
        );

        spawn(async move {
            if let Err(e) = engine.run().await {
                warn!("engine stopped: {e}");
            }
        });

        Ok(EngineHandle { tx, events, ctx, local_addr })
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn security(&self, kind: SecurityEventKind, message: String) {
        info!("{kind}: {message}");
        self.emit(EngineEvent::Security(SecurityEvent::new(kind, message)));
    }

    fn handle_event(&mut self, event: EngineEvent) {
        if let EngineEvent::Security(event) = event {
            self.security_log.push(event);
        }
    }

    /// Take the events that are waiting on our subscription.
    fn drain_events(&mut self) {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("security log missed {n} events");
                }
                Err(_) => break,
            }
        }
    }

    #[tracing::instrument(name = "engine", skip_all)]
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut snapshot_interval = interval(self.ctx.config.snapshot_interval());
        snapshot_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if !self.handle_msg(msg).await {
                        break;
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("security log missed {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = snapshot_interval.tick() => {
                    if !self.torrents.is_empty() {
                        let snapshots = self.snapshots().await;
                        self.emit(EngineEvent::Snapshot(snapshots));
                    }
                }
            }
        }

        self.accept_handle.abort();
        Ok(())
    }

    /// Returns false when the engine must stop.
    async fn handle_msg(&mut self, msg: EngineMsg) -> bool {
        match msg {
            EngineMsg::AddTorrent { bytes, download_dir, recipient } => {
                let r = match TorrentMetadata::from_torrent_file(&bytes) {
                    Ok(metadata) => {
                        let (id, name) = (metadata.info_hash, metadata.name.clone());
                        self.add(id, name, Some(Arc::new(metadata)), download_dir).await
                    }
                    Err(e) => Err(e),
                };
                let _ = recipient.send(r);
            }
            EngineMsg::AddMagnet { uri, download_dir, recipient } => {
                let r = match Magnet::new(&uri) {
                    Ok(magnet) => match magnet.parse_xt_infohash() {
                        Ok(id) => self.add(id, magnet.parse_dn(), None, download_dir).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let _ = recipient.send(r);
            }
            EngineMsg::AddPeers { id, peers, recipient } => {
                let r = self.send_torrent(&id, TorrentMsg::AddPeers(peers)).await;
                let _ = recipient.send(r);
            }
            EngineMsg::Pause(id, recipient) => {
                let _ = recipient.send(self.send_torrent(&id, TorrentMsg::Pause).await);
            }
            EngineMsg::Resume(id, recipient) => {
                let _ = recipient.send(self.send_torrent(&id, TorrentMsg::Resume).await);
            }
            EngineMsg::Remove { id, delete_files, recipient } => {
                let _ = recipient.send(self.remove(id, delete_files).await);
            }
            EngineMsg::SetUploadLimit(limit) => {
                info!("upload limit {limit} B/s");
                self.ctx.rate_limiter.upload.set_rate(limit);
            }
            EngineMsg::SetDownloadLimit(limit) => {
                info!("download limit {limit} B/s");
                self.ctx.rate_limiter.download.set_rate(limit);
            }
            EngineMsg::SetEncryptionPolicy(policy) => {
                self.ctx.encryption.store(policy.into(), Ordering::Relaxed);
                self.security(
                    SecurityEventKind::Encryption,
                    format!("encryption policy is {policy}"),
                );
            }
            EngineMsg::SetDhtEnabled(enabled) => {
                self.ctx.dht.store(enabled, Ordering::Relaxed);
                let state = if enabled { "enabled" } else { "disabled" };
                self.security(SecurityEventKind::Dht, format!("DHT {state}"));
            }
            EngineMsg::SetAnonymousMode(enabled) => {
                info!("anonymous mode {enabled}");
                self.ctx.anonymous.store(enabled, Ordering::Relaxed);
            }
            EngineMsg::SetProxy(proxy) => {
                match &proxy {
                    Some(p) => info!("proxy {:?} {}:{}", p.kind, p.host, p.port),
                    None => info!("proxy disabled"),
                }
                *self.ctx.proxy.write().await = proxy;
            }
            EngineMsg::BlockIp(ip, recipient) => {
                let r = self.block_ip(&ip).await;
                let _ = recipient.send(r);
            }
            EngineMsg::Snapshot(recipient) => {
                let _ = recipient.send(self.snapshots().await);
            }
            EngineMsg::SessionStats(recipient) => {
                let _ = recipient.send(self.session_stats().await);
            }
            EngineMsg::SecurityLog { last_n, recipient } => {
                self.drain_events();
                let _ = recipient.send(self.security_log.last(last_n));
            }
            EngineMsg::SecurityStats(recipient) => {
                self.drain_events();
                let stats = SecurityStats {
                    encryption_enabled: self.ctx.encryption_policy()
                        != EncryptionPolicy::Disabled,
                    dht_enabled: self.ctx.dht_enabled(),
                    blocked_ips_count: self.ctx.ip_filter.read().await.blocked_ips(),
                    security_events_count: self.security_log.len(),
                };
                let _ = recipient.send(stats);
            }
            EngineMsg::AllTorrentsCompleted(recipient) => {
                let snapshots = self.snapshots().await;
                let completed =
                    !snapshots.is_empty() && snapshots.iter().all(|s| s.completed);
                let _ = recipient.send(completed);
            }
            EngineMsg::ActiveTorrentCount(recipient) => {
                let snapshots = self.snapshots().await;
                let _ = recipient.send(snapshots.iter().filter(|s| s.is_active()).count());
            }
            EngineMsg::IncomingPeer(inbound) => {
                let id = inbound.handshake.info_hash;
                match self.torrents.get(&id) {
                    Some(torrent) => {
                        if torrent.tx.send(TorrentMsg::IncomingPeer(inbound)).await.is_err() {
                            debug!("torrent {id} is gone");
                        }
                    }
                    None => debug!("{} wants unknown torrent {id}", inbound.remote_addr),
                }
            }
            EngineMsg::Shutdown(recipient) => {
                self.shutdown().await;
                let _ = recipient.send(());
                return false;
            }
        }
        true
    }

    async fn add(
        &mut self,
        info_hash: InfoHash,
        name: String,
        metadata: Option<Arc<TorrentMetadata>>,
        download_dir: Option<PathBuf>,
    ) -> Result<TorrentId, Error> {
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }

        let download_dir =
            download_dir.unwrap_or_else(|| self.ctx.config.download_dir.clone());

        let mut torrent = Torrent::new(TorrentParams {
            info_hash,
            name: name.clone(),
            metadata,
            download_dir,
            engine: self.ctx.clone(),
            disk_tx: self.disk_tx.clone(),
            events: self.events.clone(),
        });
        let tx = torrent.tx.clone();

        spawn(async move {
            if let Err(e) = torrent.run().await {
                warn!("torrent stopped: {e}");
            }
        });

        info!("added torrent {name} {info_hash}");
        self.torrents.insert(info_hash, TorrentHandle { tx, name: name.clone() });
        self.ctx.info_hashes.write().await.push(info_hash);
        self.emit(EngineEvent::TorrentAdded { id: info_hash, name });

        Ok(info_hash)
    }

    async fn send_torrent(&self, id: &TorrentId, msg: TorrentMsg) -> Result<(), Error> {
        let torrent = self.torrents.get(id).ok_or(Error::TorrentDoesNotExist)?;
        torrent.tx.send(msg).await?;
        Ok(())
    }

    async fn remove(&mut self, id: TorrentId, delete_files: bool) -> Result<(), Error> {
        let torrent = self.torrents.remove(&id).ok_or(Error::TorrentDoesNotExist)?;
        self.ctx.info_hashes.write().await.retain(|h| *h != id);

        let (otx, orx) = oneshot::channel();
        if torrent
            .tx
            .send(TorrentMsg::Remove { delete_files, recipient: otx })
            .await
            .is_ok()
        {
            let _ = orx.await;
        }

        info!("removed torrent {} {id}", torrent.name);
        self.emit(EngineEvent::TorrentRemoved(id));
        Ok(())
    }

    async fn block_ip(&mut self, ip: &str) -> Result<(), Error> {
        let ip = parse_ip(ip)?;
        self.ctx.ip_filter.write().await.block_ip(ip);

        for (id, torrent) in &self.torrents {
            if torrent.tx.send(TorrentMsg::BlockIp(ip)).await.is_err() {
                debug!("torrent {id} is gone");
            }
        }

        self.security(SecurityEventKind::IpBlock, format!("blocked {ip}"));
        Ok(())
    }

    async fn snapshots(&self) -> Vec<TorrentSnapshot> {
        let mut snapshots = Vec::with_capacity(self.torrents.len());
        for torrent in self.torrents.values() {
            let (otx, orx) = oneshot::channel();
            if torrent.tx.send(TorrentMsg::GetSnapshot(otx)).await.is_err() {
                continue;
            }
            if let Ok(snapshot) = orx.await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        snapshots
    }

    async fn session_stats(&self) -> SessionStats {
        let snapshots = self.snapshots().await;
        let mut stats = SessionStats { torrents: snapshots.len(), ..Default::default() };
        for s in &snapshots {
            stats.download_rate += s.download_rate;
            stats.upload_rate += s.upload_rate;
            stats.downloaded += s.downloaded;
            stats.uploaded += s.uploaded;
            stats.peers += s.peers + s.seeds;
            stats.dht_nodes += s.dht_nodes;
            if s.is_active() {
                stats.active_torrents += 1;
            }
        }
        stats
    }

    /// Stop every torrent, which persist their resume data, and the disk.
    async fn shutdown(&mut self) {
        info!("shutting down");
        for (id, torrent) in self.torrents.drain() {
            let (otx, orx) = oneshot::channel();
            if torrent.tx.send(TorrentMsg::Shutdown(otx)).await.is_ok() {
                let _ = orx.await;
            }
            debug!("stopped torrent {id}");
        }
        self.ctx.info_hashes.write().await.clear();
        self.accept_handle.abort();
        let _ = self.disk_tx.send(DiskMsg::Quit).await;
        self.security(SecurityEventKind::Shutdown, "engine shut down".into());
        self.drain_events();
    }
}

/// Accept connections and read their handshakes, each in its own task. The
/// ones that want one of our torrents are sent to the engine.
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<EngineCtx>,
    tx: mpsc::Sender<EngineMsg>,
) {
    loop {
        let (tcp, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("could not accept connection: {e}");
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if ctx.anonymous() {
            debug!("{addr} refused in anonymous mode");
            continue;
        }
        if ctx.is_blocked(addr.ip()).await {
            debug!("{addr} refused by the IP filter");
            continue;
        }

        let ctx = ctx.clone();
        let tx = tx.clone();

        spawn(async move {
            let info_hashes = ctx.info_hashes.read().await.clone();
            let inbound = timeout(
                ctx.config.handshake_timeout(),
                peer::read_inbound(tcp, addr, &info_hashes, ctx.encryption_policy()),
            )
            .await;

            match inbound {
                Ok(Ok(inbound)) => {
                    let _ = tx.send(EngineMsg::IncomingPeer(Box::new(inbound))).await;
                }
                Ok(Err(e)) => debug!("{addr} inbound handshake failed: {e}"),
                Err(_) => debug!("{addr} inbound handshake timed out"),
            }
        });
    }
}

/// A cheap handle to a running [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
    events: broadcast::Sender<EngineEvent>,
    pub ctx: Arc<EngineCtx>,
    local_addr: SocketAddr,
}

impl EngineHandle {
    /// The address that accepts peer connections.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> EngineMsg,
    ) -> Result<T, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(msg(otx)).await?;
        Ok(orx.await?)
    }

    /// Add a torrent from the bytes of a `.torrent` file.
    pub async fn add_torrent(
        &self,
        bytes: Vec<u8>,
        download_dir: Option<PathBuf>,
    ) -> Result<TorrentId, Error> {
        self.request(|recipient| EngineMsg::AddTorrent { bytes, download_dir, recipient })
            .await?
    }

    pub async fn add_magnet(
        &self,
        uri: &str,
        download_dir: Option<PathBuf>,
    ) -> Result<TorrentId, Error> {
        let uri = uri.to_owned();
        self.request(|recipient| EngineMsg::AddMagnet { uri, download_dir, recipient })
            .await?
    }

    /// Give the torrent addresses of peers to connect to.
    pub async fn add_peers(
        &self,
        id: TorrentId,
        peers: Vec<SocketAddr>,
    ) -> Result<(), Error> {
        self.request(|recipient| EngineMsg::AddPeers { id, peers, recipient }).await?
    }

    pub async fn pause(&self, id: TorrentId) -> Result<(), Error> {
        self.request(|recipient| EngineMsg::Pause(id, recipient)).await?
    }

    pub async fn resume(&self, id: TorrentId) -> Result<(), Error> {
        self.request(|recipient| EngineMsg::Resume(id, recipient)).await?
    }

    pub async fn remove(&self, id: TorrentId, delete_files: bool) -> Result<(), Error> {
        self.request(|recipient| EngineMsg::Remove { id, delete_files, recipient })
            .await?
    }

    /// Bytes per second, 0 is unlimited.
    pub async fn set_upload_limit(&self, limit: u64) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::SetUploadLimit(limit)).await?)
    }

    /// Bytes per second, 0 is unlimited.
    pub async fn set_download_limit(&self, limit: u64) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::SetDownloadLimit(limit)).await?)
    }

    pub async fn set_encryption_policy(&self, policy: EncryptionPolicy) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::SetEncryptionPolicy(policy)).await?)
    }

    pub async fn set_dht_enabled(&self, enabled: bool) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::SetDhtEnabled(enabled)).await?)
    }

    pub async fn set_anonymous_mode(&self, enabled: bool) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::SetAnonymousMode(enabled)).await?)
    }

    /// Tunnel every new outbound peer connection through a proxy. Returns
    /// false if the configuration is not valid, in which case nothing
    /// changes.
    pub async fn set_proxy(
        &self,
        kind: ProxyKind,
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> bool {
        let proxy = match ProxyConfig::new(kind, host, port, username, password) {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!("{e}");
                return false;
            }
        };
        self.tx.send(EngineMsg::SetProxy(Some(proxy))).await.is_ok()
    }

    pub async fn disable_proxy(&self) -> Result<(), Error> {
        Ok(self.tx.send(EngineMsg::SetProxy(None)).await?)
    }

    /// Block an IPv4 or IPv6 address, and disconnect the peers that have
    /// it.
    pub async fn block_ip(&self, ip: &str) -> Result<(), Error> {
        let ip = ip.to_owned();
        self.request(|recipient| EngineMsg::BlockIp(ip, recipient)).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<TorrentSnapshot>, Error> {
        self.request(EngineMsg::Snapshot).await
    }

    pub async fn session_stats(&self) -> Result<SessionStats, Error> {
        self.request(EngineMsg::SessionStats).await
    }

    /// The newest `last_n` security events, oldest first.
    pub async fn security_log(&self, last_n: usize) -> Result<Vec<SecurityEvent>, Error> {
        self.request(|recipient| EngineMsg::SecurityLog { last_n, recipient }).await
    }

    pub async fn security_stats(&self) -> Result<SecurityStats, Error> {
        self.request(EngineMsg::SecurityStats).await
    }

    pub async fn all_torrents_completed(&self) -> Result<bool, Error> {
        self.request(EngineMsg::AllTorrentsCompleted).await
    }

    pub async fn active_torrent_count(&self) -> Result<usize, Error> {
        self.request(EngineMsg::ActiveTorrentCount).await
    }

    /// Persist the resume data of every torrent and stop the engine.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.request(EngineMsg::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let dir = std::env::temp_dir().join("brisa-engine-tests");
        Config {
            download_dir: dir.join("downloads"),
            resume_dir: dir.join("resume"),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn peer_slots() {
        let ctx = EngineCtx::new(Config { max_global_peers: 2, ..config() });
        assert!(ctx.reserve_peer());
        assert!(ctx.reserve_peer());
        assert!(!ctx.reserve_peer());
        ctx.release_peer();
        assert_eq!(ctx.peer_count(), 1);
        assert!(ctx.reserve_peer());
        ctx.release_peer();
        ctx.release_peer();
        ctx.release_peer();
        assert_eq!(ctx.peer_count(), 0);
    }

    #[test]
    fn anonymous_peer_id() {
        let ctx = EngineCtx::new(config());
        assert_eq!(&ctx.peer_id().0[..8], b"-BR0100-");
        ctx.anonymous.store(true, Ordering::Relaxed);
        assert_ne!(&ctx.peer_id().0[..8], b"-BR0100-");
        assert_eq!(ctx.peer_id(), ctx.peer_id());
    }

    #[test]
    fn kind_names() {
        assert_eq!(SecurityEventKind::HashMismatch.to_string(), "HASH_MISMATCH");
        assert_eq!(SecurityEventKind::IpFilter.to_string(), "IP_FILTER");
    }

    #[tokio::test]
    async fn reserved_ranges_are_blocked() {
        let ctx = EngineCtx::new(config());
        assert!(ctx.is_blocked("127.0.0.1".parse().unwrap()).await);
        assert!(!ctx.is_blocked("1.1.1.1".parse().unwrap()).await);

        let ctx = EngineCtx::new(Config { block_reserved_ranges: false, ..config() });
        assert!(!ctx.is_blocked("127.0.0.1".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn security_log_and_settings() -> Result<(), Error> {
        let engine = Engine::start(Config { block_reserved_ranges: false, ..config() }).await?;

        assert!(engine.block_ip("not an ip").await.is_err());
        engine.block_ip("10.0.0.1").await?;
        engine.set_encryption_policy(EncryptionPolicy::Required).await?;
        engine.set_dht_enabled(false).await?;

        assert!(!engine.set_proxy(ProxyKind::Http, "", 8080, None, None).await);
        assert!(
            !engine
                .set_proxy(ProxyKind::Http, "proxy", 8080, Some("a".into()), Some("b".into()))
                .await
        );
        assert!(engine.set_proxy(ProxyKind::Socks5, "proxy", 1080, None, None).await);

        let log = engine.security_log(50).await?;
        let kinds: Vec<_> = log.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SecurityEventKind::IpFilter,
                SecurityEventKind::IpBlock,
                SecurityEventKind::Encryption,
                SecurityEventKind::Dht,
            ]
        );

        let log = engine.security_log(2).await?;
        let kinds: Vec<_> = log.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![SecurityEventKind::Encryption, SecurityEventKind::Dht]);
        assert!(engine.security_log(0).await?.is_empty());

        assert_eq!(
            engine.security_stats().await?,
            SecurityStats {
                encryption_enabled: true,
                dht_enabled: false,
                blocked_ips_count: 1,
                security_events_count: 4,
            }
        );

        // blocking the same address twice counts it once
        engine.block_ip("10.0.0.1").await?;
        engine.set_encryption_policy(EncryptionPolicy::Disabled).await?;
        let stats = engine.security_stats().await?;
        assert!(!stats.encryption_enabled);
        assert_eq!(stats.blocked_ips_count, 1);
        assert_eq!(stats.security_events_count, 6);

        assert!(engine.ctx.is_blocked("10.0.0.1".parse().unwrap()).await);
        assert_eq!(engine.ctx.encryption_policy(), EncryptionPolicy::Required);
        assert!(!engine.ctx.dht_enabled());
        assert!(engine.ctx.proxy.read().await.is_some());

        assert!(!engine.all_torrents_completed().await?);
        assert_eq!(engine.active_torrent_count().await?, 0);
        assert!(matches!(
            engine.pause(InfoHash([1; 20])).await,
            Err(Error::TorrentDoesNotExist)
        ));
        assert!(engine.add_torrent(b"garbage".to_vec(), None).await.is_err());
        assert!(engine.add_magnet("magnet:?dn=nohash", None).await.is_err());

        engine.shutdown().await?;
        Ok(())
    }

    #[test]
    fn security_log_is_trimmed() {
        let mut log = SecurityLog::default();
        for i in 0..SECURITY_LOG_MAX {
            log.push(SecurityEvent::new(SecurityEventKind::IpBlock, i.to_string()));
        }
        assert_eq!(log.len(), SECURITY_LOG_MAX);

        log.push(SecurityEvent::new(SecurityEventKind::IpBlock, SECURITY_LOG_MAX.to_string()));
        assert_eq!(log.len(), SECURITY_LOG_TRIM);

        let events = log.last(usize::MAX);
        assert_eq!(events.len(), SECURITY_LOG_TRIM);
        assert_eq!(events[0].message, (SECURITY_LOG_MAX + 1 - SECURITY_LOG_TRIM).to_string());
        assert_eq!(events[SECURITY_LOG_TRIM - 1].message, SECURITY_LOG_MAX.to_string());

        let newest = log.last(3);
        let messages: Vec<_> = newest.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["998", "999", "1000"]);
    }
}
