//! A remote peer in the network that downloads and uploads data
pub mod choke;
mod handshake;
pub mod session;
mod types;

// re-exports
pub use types::*;

pub(crate) use handshake::read_inbound;

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use hashbrown::{HashMap, HashSet};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, BrisaBitfield, Reserved},
    disk::DiskMsg,
    engine::EngineCtx,
    error::Error,
    extensions::{
        core::{Block, BlockInfo, Core},
        metadata_pieces, ExtendedMessage, Extension, MetadataMsg,
        EXTENDED_HANDSHAKE_ID, LOCAL_REQQ, LOCAL_UT_METADATA_ID,
        MAX_METADATA_SIZE,
    },
    metainfo::TorrentMetadata,
    peer::{
        handshake::{Handshaked, PeerSocket},
        session::{ConnectionState, Session},
    },
    torrent::{InfoHash, TorrentMsg},
};

/// A metadata request that is not answered after this long is given to
/// another peer.
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What a peer needs from its torrent to start.
#[derive(Debug, Clone)]
pub struct PeerArgs {
    pub info_hash: InfoHash,
    pub torrent_tx: mpsc::Sender<TorrentMsg>,
    pub disk_tx: mpsc::Sender<DiskMsg>,
    pub engine: Arc<EngineCtx>,
    /// `None` for magnet torrents that are still downloading the info.
    pub metadata: Option<Arc<TorrentMetadata>>,
    /// Pieces that we have.
    pub local_pieces: Bitfield,
    /// Closes the connection, in any state.
    pub cancel: CancellationToken,
}

/// Dial `addr`, handshake and run the event loop until the connection
/// closes. The torrent always hears back, with
/// [`TorrentMsg::PeerConnectFailed`] or [`TorrentMsg::PeerDisconnected`].
pub async fn run_outbound(
    addr: SocketAddr,
    args: PeerArgs,
    rx: mpsc::Receiver<PeerMsg>,
) {
    let mut session = Session::new(args.engine.config.request_timeout());

    let handshaked = select! {
        r = handshake::connect(addr, args.info_hash, &args.engine, &mut session) => r,
        _ = args.cancel.cancelled() => Err(Error::PeerCancelled),
    };

    match handshaked {
        Ok(handshaked) => {
            let peer = Peer::new(
                handshaked,
                addr,
                Direction::Outbound,
                session,
                args,
                rx,
            );
            peer.run_until_closed().await;
        }
        Err(e) => {
            debug!("{addr} could not connect: {e}");
            let _ = args.torrent_tx.send(TorrentMsg::PeerConnectFailed(addr)).await;
        }
    }
}

/// Finish the handshake of an inbound connection and run the event loop
/// until the connection closes.
pub async fn run_inbound(
    inbound: InboundPeer,
    args: PeerArgs,
    rx: mpsc::Receiver<PeerMsg>,
) {
    let addr = inbound.remote_addr;
    let mut session = Session::new(args.engine.config.request_timeout());

    let handshaked = select! {
        r = handshake::accept(inbound, &args.engine, &mut session) => r,
        _ = args.cancel.cancelled() => Err(Error::PeerCancelled),
    };

    match handshaked {
        Ok(handshaked) => {
            let peer = Peer::new(
                handshaked,
                addr,
                Direction::Inbound,
                session,
                args,
                rx,
            );
            peer.run_until_closed().await;
        }
        Err(e) => {
            debug!("{addr} inbound handshake failed: {e}");
            let _ = args.torrent_tx.send(TorrentMsg::PeerConnectFailed(addr)).await;
        }
    }
}

/// A connected peer, after the handshakes.
pub struct Peer {
    pub ctx: Arc<PeerCtx>,
    sink: SplitSink<PeerSocket, Core>,
    stream: SplitStream<PeerSocket>,
    rx: mpsc::Receiver<PeerMsg>,
    cancel: CancellationToken,
    torrent_tx: mpsc::Sender<TorrentMsg>,
    engine: Arc<EngineCtx>,
    session: Session,
    metadata: Option<Arc<TorrentMetadata>>,
    /// Pieces that the peer has.
    pieces: Bitfield,
    /// Pieces that we have.
    local_pieces: Bitfield,
    reserved: Reserved,
    /// The extended handshake of the peer.
    extension: Option<Extension>,
    /// Blocks we requested and are waiting for, with the time of the request.
    outgoing_requests: HashMap<BlockInfo, Instant>,
    /// Blocks the peer requested and we did not send yet.
    incoming_requests: HashSet<BlockInfo>,
    /// Requests of the peer, read from disk by the uploader task.
    upload_tx: mpsc::Sender<BlockInfo>,
    upload_rx: mpsc::Receiver<Block>,
    /// The metadata piece requested from this peer.
    metadata_request: Option<(u32, Instant)>,
    /// The socket is not read until the download limiter was paid for the
    /// last block: when the wait started, and when it ends.
    throttled: Option<(Instant, Instant)>,
}

impl Peer {
    fn new(
        handshaked: Handshaked,
        remote_addr: SocketAddr,
        direction: Direction,
        mut session: Session,
        args: PeerArgs,
        rx: mpsc::Receiver<PeerMsg>,
    ) -> Self {
        let Handshaked { socket, handshake, encrypted } = handshaked;
        let (sink, stream) = socket.split();

        let ctx = Arc::new(PeerCtx::new(
            handshake.peer_id.clone(),
            remote_addr,
            direction,
            encrypted,
        ));

        let (upload_tx, uploader_rx) = mpsc::channel(LOCAL_REQQ as usize);
        let (uploader_tx, upload_rx) = mpsc::channel(8);

        tokio::spawn(uploader(
            args.info_hash,
            args.disk_tx,
            args.engine.clone(),
            uploader_rx,
            uploader_tx,
        ));

        let pieces = match &args.metadata {
            Some(metadata) => Bitfield::from_piece(metadata.num_pieces()),
            None => Bitfield::new(),
        };

        session.state = ConnectionState::AwaitingBitfield;

        Self {
            ctx,
            sink,
            stream,
            rx,
            cancel: args.cancel,
            torrent_tx: args.torrent_tx,
            engine: args.engine,
            session,
            metadata: args.metadata,
            pieces,
            local_pieces: args.local_pieces,
            reserved: handshake.reserved(),
            extension: None,
            outgoing_requests: HashMap::new(),
            incoming_requests: HashSet::new(),
            upload_tx,
            upload_rx,
            metadata_request: None,
            throttled: None,
        }
    }

    async fn run_until_closed(mut self) {
        let addr = self.ctx.remote_addr;

        match self.run().await {
            Ok(()) => debug!("{addr} closed"),
            Err(e) => warn!("{addr} closed: {e}"),
        }

        self.session.state = ConnectionState::Closing;

        // the torrent releases every block of the peer in the scheduler
        let _ = self
            .torrent_tx
            .send(TorrentMsg::PeerDisconnected(self.ctx.id.clone(), addr))
            .await;

        self.session.state = ConnectionState::Closed;
    }

    /// Start the event loop of the Peer, listen to messages sent by others
    /// on the peer wire protocol.
    #[tracing::instrument(name = "peer", skip_all, fields(addr = %self.ctx.remote_addr))]
    pub async fn run(&mut self) -> Result<(), Error> {
        self.torrent_tx.send(TorrentMsg::PeerConnected(self.ctx.clone())).await?;

        if self.local_pieces.any() {
            debug!("sending bitfield");
            self.send(Core::Bitfield(self.local_pieces.clone())).await?;
        }

        if self.reserved.supports_extended() {
            let metadata_size =
                self.metadata.as_ref().map(|m| m.info_bytes.len() as u32);
            let ext = Extension::supported(
                metadata_size,
                self.engine.listen_port(),
                self.engine.anonymous(),
            );
            let msg: ExtendedMessage = ext.try_into()?;
            self.send(msg.into()).await?;
        }

        if self.engine.dht_enabled() && self.reserved.supports_dht() {
            self.send(Core::Port(self.engine.listen_port())).await?;
        }

        // update the request window, check for timed-out requests, etc.
        let mut tick_interval = interval(Duration::from_secs(1));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.cancel.cancelled() => {
                    debug!("quit");
                    return Ok(());
                }
                _ = sleep_until(self.throttled.map_or_else(Instant::now, |(_, end)| end)),
                    if self.throttled.is_some() =>
                {
                    self.throttle_ended();
                }
                msg = self.stream.next(), if self.throttled.is_none() => {
                    let Some(msg) = msg else {
                        return Err(Error::PeerClosedSocket);
                    };
                    self.session.last_received = Instant::now();
                    self.handle_message(msg?).await?;
                }
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    self.handle_peer_msg(msg).await?;
                }
                Some(block) = self.upload_rx.recv() => {
                    self.upload(block).await?;
                }
                _ = tick_interval.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    async fn send(&mut self, msg: Core) -> Result<(), Error> {
        self.sink.send(msg).await?;
        self.session.last_sent = Instant::now();
        Ok(())
    }

    /// Handle a message sent by the peer.
    async fn handle_message(&mut self, msg: Core) -> Result<(), Error> {
        if self.session.state == ConnectionState::AwaitingBitfield {
            if let Core::Bitfield(bitfield) = msg {
                return self.handle_bitfield(bitfield).await;
            }
            self.session.state = ConnectionState::Active;
        }

        match msg {
            Core::KeepAlive => {}
            Core::Bitfield(_) => {
                warn!("bitfield received after the first message");
                return Err(Error::MessageResponse);
            }
            Core::Choke => {
                debug!("peer choked us");
                self.ctx.peer_choking.store(true, Ordering::Relaxed);
                self.release_requests().await?;
            }
            Core::Unchoke => {
                debug!("peer unchoked us");
                self.ctx.peer_choking.store(false, Ordering::Relaxed);
                self.session.prepare_for_download();
                self.request_blocks().await?;
            }
            Core::Interested => {
                if !self.ctx.peer_interested.swap(true, Ordering::Relaxed) {
                    self.torrent_tx
                        .send(TorrentMsg::PeerInterested(self.ctx.id.clone()))
                        .await?;
                }
            }
            Core::NotInterested => {
                self.ctx.peer_interested.store(false, Ordering::Relaxed);
            }
            Core::Have(piece) => {
                if self.metadata.as_ref().is_some_and(|m| piece >= m.num_pieces()) {
                    warn!("have of piece {piece} out of range");
                    return Err(Error::MessageResponse);
                }
                self.pieces.safe_set(piece);
                self.update_seed();
                self.torrent_tx
                    .send(TorrentMsg::PeerHave(self.ctx.id.clone(), piece))
                    .await?;
                self.update_interest().await?;
            }
            Core::Request(block_info) => self.handle_request(block_info),
            Core::Piece(block) => self.handle_block(block).await?,
            Core::Cancel(block_info) => {
                self.incoming_requests.remove(&block_info);
            }
            Core::Port(port) => {
                if self.engine.dht_enabled() && port != 0 {
                    let addr = SocketAddr::new(self.ctx.remote_addr.ip(), port);
                    self.torrent_tx.send(TorrentMsg::DhtPort(addr)).await?;
                }
            }
            Core::Extended(ExtendedMessage(EXTENDED_HANDSHAKE_ID, payload)) => {
                self.handle_extended_handshake(&payload).await?;
            }
            Core::Extended(ExtendedMessage(LOCAL_UT_METADATA_ID, payload)) => {
                self.handle_metadata_msg(&payload).await?;
            }
            Core::Extended(ExtendedMessage(id, _)) => {
                debug!("unknown extended message {id}");
            }
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, mut bitfield: Bitfield) -> Result<(), Error> {
        self.session.state = ConnectionState::Active;

        if let Some(metadata) = &self.metadata {
            let pieces = metadata.num_pieces();
            // the bitfield is padded to a whole byte, and the spare bits
            // must be cleared
            if bitfield.len() < pieces || bitfield[pieces..].any() {
                warn!("bitfield of {} bits for {pieces} pieces", bitfield.len());
                return Err(Error::MessageResponse);
            }
            bitfield.truncate(pieces);
        }

        debug!("received bitfield with {} pieces", bitfield.count_ones());
        self.pieces = bitfield;
        self.update_seed();

        if self.metadata.is_some() {
            self.torrent_tx
                .send(TorrentMsg::PeerBitfield(
                    self.ctx.id.clone(),
                    self.pieces.clone(),
                ))
                .await?;
        }

        self.update_interest().await
    }

    fn handle_request(&mut self, block_info: BlockInfo) {
        if self.ctx.am_choking() {
            debug!("request while choked {block_info:?}");
            return;
        }
        let Some(metadata) = &self.metadata else { return };
        let index = block_info.index as usize;

        if index >= metadata.num_pieces()
            || !block_info.is_valid(metadata.piece_size(index))
        {
            debug!("invalid request {block_info:?}");
            return;
        }
        if !self.local_pieces.get(index).is_some_and(|b| *b) {
            debug!("request of a piece we don't have {block_info:?}");
            return;
        }
        if self.incoming_requests.len() >= LOCAL_REQQ as usize {
            debug!("request queue is full");
            return;
        }
        if self.incoming_requests.insert(block_info)
            && self.upload_tx.try_send(block_info).is_err()
        {
            self.incoming_requests.remove(&block_info);
        }
    }

    async fn handle_block(&mut self, block: Block) -> Result<(), Error> {
        let block_info = BlockInfo::from(&block);

        if self.outgoing_requests.remove(&block_info).is_none() {
            debug!("unrequested block {block_info:?}");
            return Ok(());
        }

        self.session.update_download_stats(block_info.len);
        self.ctx.counter.record_download(block_info.len as u64);
        if let Some(end) =
            self.engine.rate_limiter.download.reserve(block_info.len as u64)
        {
            self.throttled = Some((Instant::now(), end));
        }

        self.torrent_tx
            .send(TorrentMsg::BlockReceived(self.ctx.id.clone(), block))
            .await?;

        self.request_blocks().await
    }

    /// The time the socket was not read does not count against the
    /// requests and the idle check.
    fn throttle_ended(&mut self) {
        let Some((start, _)) = self.throttled.take() else { return };
        let now = Instant::now();
        let waited = now - start;
        for requested in self.outgoing_requests.values_mut() {
            *requested = (*requested + waited).min(now);
        }
        self.session.last_received = (self.session.last_received + waited).min(now);
    }

    async fn handle_extended_handshake(&mut self, payload: &[u8]) -> Result<(), Error> {
        let ext = Extension::try_from(payload)?;
        debug!("extended handshake {ext:?}");

        self.session.set_reqq(ext.reqq);

        if let Some(size) = ext.metadata_size {
            if size == 0 || size > MAX_METADATA_SIZE {
                warn!("peer advertised metadata of {size} bytes");
            } else if self.metadata.is_none() {
                self.torrent_tx
                    .send(TorrentMsg::MetadataSize(self.ctx.id.clone(), size as usize))
                    .await?;
            }
        }

        self.extension = Some(ext);
        self.request_metadata().await
    }

    async fn handle_metadata_msg(&mut self, payload: &[u8]) -> Result<(), Error> {
        match MetadataMsg::from_payload(payload)? {
            MetadataMsg::Request(piece) => {
                let Some(ut_metadata) =
                    self.extension.as_ref().and_then(|e| e.m.ut_metadata)
                else {
                    return Ok(());
                };
                let reply = match &self.metadata {
                    Some(metadata)
                        if (piece as usize)
                            < metadata_pieces(metadata.info_bytes.len()) =>
                    {
                        MetadataMsg::data(piece, &metadata.info_bytes)
                    }
                    _ => MetadataMsg::Reject(piece),
                };
                self.send(reply.into_extended(ut_metadata)?.into()).await?;
            }
            MetadataMsg::Response { piece, payload, .. } => {
                if self.metadata_request.is_some_and(|(p, _)| p == piece) {
                    self.metadata_request = None;
                }
                self.torrent_tx
                    .send(TorrentMsg::MetadataPiece(self.ctx.id.clone(), piece, payload))
                    .await?;
                self.request_metadata().await?;
            }
            MetadataMsg::Reject(piece) => {
                debug!("metadata piece {piece} rejected");
                if self.metadata_request.is_some_and(|(p, _)| p == piece) {
                    self.metadata_request = None;
                }
                self.torrent_tx
                    .send(TorrentMsg::MetadataReject(self.ctx.id.clone(), piece))
                    .await?;
            }
        }
        Ok(())
    }

    /// Handle a message sent by the torrent.
    async fn handle_peer_msg(&mut self, msg: PeerMsg) -> Result<(), Error> {
        match msg {
            PeerMsg::HavePiece(piece) => {
                self.local_pieces.safe_set(piece);
                if !self.pieces.get(piece).is_some_and(|b| *b) {
                    self.send(Core::Have(piece)).await?;
                }
                self.update_interest().await?;
            }
            PeerMsg::RequestBlocks => self.request_blocks().await?,
            PeerMsg::CancelBlock(block_info) => {
                if self.outgoing_requests.remove(&block_info).is_some() {
                    self.send(Core::Cancel(block_info)).await?;
                }
            }
            PeerMsg::Choke => {
                if !self.ctx.am_choking() {
                    debug!("choking peer");
                    self.ctx.am_choking.store(true, Ordering::Relaxed);
                    self.incoming_requests.clear();
                    self.send(Core::Choke).await?;
                }
            }
            PeerMsg::Unchoke => {
                if self.ctx.am_choking() {
                    debug!("unchoking peer");
                    self.ctx.am_choking.store(false, Ordering::Relaxed);
                    self.send(Core::Unchoke).await?;
                }
            }
            PeerMsg::HaveInfo(metadata, local_pieces) => {
                let pieces = metadata.num_pieces();
                self.pieces.resize(pieces, false);
                self.metadata = Some(metadata);
                self.metadata_request = None;
                self.local_pieces = local_pieces;
                self.update_seed();

                // too late for a bitfield
                for piece in self.local_pieces.iter_ones().collect::<Vec<_>>() {
                    if !self.pieces.get(piece).is_some_and(|b| *b) {
                        self.sink.feed(Core::Have(piece)).await?;
                    }
                }
                self.sink.flush().await?;

                self.torrent_tx
                    .send(TorrentMsg::PeerBitfield(
                        self.ctx.id.clone(),
                        self.pieces.clone(),
                    ))
                    .await?;
                self.update_interest().await?;
            }
        }
        Ok(())
    }

    /// Send a block that the uploader read from disk, if the peer still
    /// wants it.
    async fn upload(&mut self, block: Block) -> Result<(), Error> {
        let block_info = BlockInfo::from(&block);
        if !self.incoming_requests.remove(&block_info) || self.ctx.am_choking() {
            return Ok(());
        }
        let len = block.block.len() as u64;
        self.send(Core::Piece(block)).await?;
        self.ctx.counter.record_upload(len);
        Ok(())
    }

    /// Ask the torrent for blocks until the request window is full.
    async fn request_blocks(&mut self) -> Result<(), Error> {
        if self.metadata.is_none()
            || self.ctx.peer_choking()
            || !self.ctx.am_interested()
        {
            return Ok(());
        }

        let target = self.session.target_request_queue_len as usize;
        let pending = self.outgoing_requests.len();
        if pending >= target {
            return Ok(());
        }

        let (otx, orx) = oneshot::channel();
        self.torrent_tx
            .send(TorrentMsg::RequestBlocks {
                peer_id: self.ctx.id.clone(),
                qnt: target - pending,
                recipient: otx,
            })
            .await?;
        let block_infos = orx.await?;

        if block_infos.is_empty() {
            return Ok(());
        }

        debug!("requesting {} blocks", block_infos.len());
        let now = Instant::now();
        self.session.last_outgoing_request_time = Some(now);

        for block_info in block_infos {
            self.outgoing_requests.insert(block_info, now);
            self.sink.feed(Core::Request(block_info)).await?;
        }
        self.sink.flush().await?;
        self.session.last_sent = now;

        Ok(())
    }

    /// Give every outstanding request back to the scheduler.
    async fn release_requests(&mut self) -> Result<(), Error> {
        if self.outgoing_requests.is_empty() {
            return Ok(());
        }
        let block_infos: Vec<BlockInfo> =
            self.outgoing_requests.drain().map(|(b, _)| b).collect();
        self.torrent_tx
            .send(TorrentMsg::ReleaseBlocks(self.ctx.id.clone(), block_infos))
            .await?;
        Ok(())
    }

    /// Ask the torrent which metadata piece to request from this peer.
    async fn request_metadata(&mut self) -> Result<(), Error> {
        if self.metadata.is_some() || self.metadata_request.is_some() {
            return Ok(());
        }
        let Some(ut_metadata) =
            self.extension.as_ref().and_then(|e| e.m.ut_metadata)
        else {
            return Ok(());
        };

        let (otx, orx) = oneshot::channel();
        self.torrent_tx
            .send(TorrentMsg::RequestMetadataPiece(self.ctx.id.clone(), otx))
            .await?;
        let Some(piece) = orx.await? else { return Ok(()) };

        debug!("requesting metadata piece {piece}");
        let msg = MetadataMsg::Request(piece).into_extended(ut_metadata)?;
        self.send(msg.into()).await?;
        self.metadata_request = Some((piece, Instant::now()));

        Ok(())
    }

    /// Send interested or not interested, when it changes. We are interested
    /// while the peer has a piece that we don't.
    async fn update_interest(&mut self) -> Result<(), Error> {
        let interested = self.metadata.is_some()
            && self
                .pieces
                .iter_ones()
                .any(|piece| !self.local_pieces.get(piece).is_some_and(|b| *b));

        if interested == self.ctx.am_interested() {
            return Ok(());
        }

        self.ctx.am_interested.store(interested, Ordering::Relaxed);

        if interested {
            debug!("sending interested");
            self.send(Core::Interested).await?;
            self.request_blocks().await?;
        } else {
            debug!("sending not interested");
            self.send(Core::NotInterested).await?;
        }
        Ok(())
    }

    fn update_seed(&self) {
        let is_seed = self
            .metadata
            .as_ref()
            .is_some_and(|m| self.pieces.len() >= m.num_pieces() && self.pieces.all());
        self.ctx.is_seed.store(is_seed, Ordering::Relaxed);
    }

    /// Runs every second.
    async fn tick(&mut self) -> Result<(), Error> {
        self.session.tick();

        // blocks may be waiting in the socket while it is not read
        let throttled = self.throttled.is_some();

        let timeout = self.session.request_timeout();
        let now = Instant::now();
        let timed_out: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, requested)| {
                !throttled && now.duration_since(**requested) >= timeout
            })
            .map(|(block_info, _)| *block_info)
            .collect();

        if !timed_out.is_empty() {
            debug!("{} requests timed out after {timeout:?}", timed_out.len());
            self.session.register_request_timeout();

            for block_info in &timed_out {
                self.outgoing_requests.remove(block_info);
                self.sink.feed(Core::Cancel(*block_info)).await?;
            }
            self.sink.flush().await?;
            self.session.last_sent = now;

            self.torrent_tx
                .send(TorrentMsg::ReleaseBlocks(self.ctx.id.clone(), timed_out))
                .await?;

            if self.session.timed_out_request_count
                >= self.engine.config.max_request_timeouts
            {
                return Err(Error::RequestTimeout);
            }
        }

        if !throttled && self.session.is_idle() {
            return Err(Error::Timeout);
        }

        if self.session.needs_keep_alive() {
            self.send(Core::KeepAlive).await?;
        }

        if let Some((piece, requested)) = self.metadata_request {
            if requested.elapsed() >= METADATA_REQUEST_TIMEOUT {
                debug!("metadata piece {piece} timed out");
                self.metadata_request = None;
                self.torrent_tx
                    .send(TorrentMsg::MetadataReject(self.ctx.id.clone(), piece))
                    .await?;
            }
        }
        self.request_metadata().await?;

        self.request_blocks().await
    }
}

/// Serves the requests of a peer: reads the blocks from disk and waits for
/// upload tokens, so the event loop of the peer never blocks on either.
async fn uploader(
    info_hash: InfoHash,
    disk_tx: mpsc::Sender<DiskMsg>,
    engine: Arc<EngineCtx>,
    mut rx: mpsc::Receiver<BlockInfo>,
    tx: mpsc::Sender<Block>,
) {
    while let Some(block_info) = rx.recv().await {
        let (otx, orx) = oneshot::channel();
        let msg = DiskMsg::ReadBlock { info_hash, block_info, recipient: otx };
        if disk_tx.send(msg).await.is_err() {
            break;
        }
        let data = match orx.await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                debug!("could not read {block_info:?}: {e}");
                continue;
            }
            Err(_) => break,
        };

        engine.rate_limiter.upload.acquire(data.len() as u64).await;

        let block = Block {
            index: block_info.index as usize,
            begin: block_info.begin,
            block: data,
        };
        if tx.send(block).await.is_err() {
            break;
        }
    }
}
