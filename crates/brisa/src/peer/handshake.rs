//! Everything that happens before the peer wire protocol: dialing, the
//! encrypted handshake and the BitTorrent handshake.
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use tracing::debug;

use crate::{
    encryption::{self, EncryptionPolicy, PeerStream},
    engine::EngineCtx,
    error::Error,
    extensions::core::{CoreCodec, Handshake, HandshakeCodec},
    peer::{session::ConnectionState, session::Session, InboundPeer},
    torrent::InfoHash,
};

pub(crate) type PeerSocket = Framed<PeerStream, CoreCodec>;

/// A connection that finished the handshakes and speaks the core protocol.
pub(crate) struct Handshaked {
    pub socket: PeerSocket,
    /// The handshake of the remote peer.
    pub handshake: Handshake,
    pub encrypted: bool,
}

/// Open a TCP connection to `addr`, through the proxy if one is set.
async fn dial(addr: SocketAddr, engine: &EngineCtx) -> Result<TcpStream, Error> {
    let proxy = engine.proxy.read().await.clone();
    let connect = async {
        match proxy {
            Some(proxy) => proxy.connect(addr).await,
            None => Ok(TcpStream::connect(addr).await?),
        }
    };
    timeout(engine.config.connect_timeout(), connect)
        .await
        .map_err(|_| Error::ConnectTimeout)?
}

/// Connect to a peer and run the handshakes as the initiator.
pub(crate) async fn connect(
    addr: SocketAddr,
    info_hash: InfoHash,
    engine: &EngineCtx,
    session: &mut Session,
) -> Result<Handshaked, Error> {
    if engine.is_blocked(addr.ip()).await {
        return Err(Error::PeerBlocked);
    }

    session.state = ConnectionState::Connecting;
    let ours = Handshake::new(info_hash, engine.peer_id(), engine.dht_enabled());
    let policy = engine.encryption_policy();
    let handshake_timeout = engine.config.handshake_timeout();

    let mut stream = None;

    if policy != EncryptionPolicy::Disabled {
        let mut tcp = dial(addr, engine).await?;
        session.state = ConnectionState::Handshaking;

        let payload = ours.serialize()?;
        let negotiated = timeout(
            handshake_timeout,
            encryption::initiate(
                &mut tcp,
                &info_hash,
                policy.allows_plaintext(),
                &payload,
            ),
        )
        .await;

        match negotiated {
            Ok(Ok(cipher)) => {
                stream = Some(PeerStream::with_prefix(tcp, cipher, &[]));
            }
            Ok(Err(e)) if policy == EncryptionPolicy::Required => {
                debug!("{addr} encrypted handshake failed: {e}");
                return Err(Error::EncryptionRequired);
            }
            Err(_) if policy == EncryptionPolicy::Required => {
                return Err(Error::HandshakeTimeout);
            }
            _ => {
                debug!("{addr} does not support encryption, retrying in plaintext");
            }
        }
    }

    // the handshake was the initial payload of the encrypted handshake
    let sent = stream.is_some();

    let stream = match stream {
        Some(stream) => stream,
        None => {
            let tcp = dial(addr, engine).await?;
            session.state = ConnectionState::Handshaking;
            PeerStream::plain(tcp)
        }
    };

    let encrypted = stream.is_encrypted();
    let mut socket = Framed::new(stream, HandshakeCodec);

    if !sent {
        debug!("{addr} sending the first handshake");
        socket.send(ours.clone()).await?;
    }

    let theirs = timeout(handshake_timeout, socket.next())
        .await
        .map_err(|_| Error::HandshakeTimeout)?
        .ok_or(Error::PeerClosedSocket)??;

    if !ours.validate(&theirs) || theirs.peer_id == ours.peer_id {
        return Err(Error::HandshakeInvalid);
    }

    Ok(Handshaked { socket: into_core(socket), handshake: theirs, encrypted })
}

/// Finish the handshake of a connection accepted by the engine, their
/// handshake was already read and matched to the torrent.
pub(crate) async fn accept(
    inbound: InboundPeer,
    engine: &EngineCtx,
    session: &mut Session,
) -> Result<Handshaked, Error> {
    session.state = ConnectionState::Handshaking;
    let InboundPeer { mut socket, handshake: theirs, remote_addr } = inbound;

    let ours = Handshake::new(
        theirs.info_hash,
        engine.peer_id(),
        engine.dht_enabled(),
    );

    if !ours.validate(&theirs) || theirs.peer_id == ours.peer_id {
        return Err(Error::HandshakeInvalid);
    }

    debug!("{remote_addr} sending the second handshake");
    socket.send(ours).await?;

    let encrypted = socket.get_ref().is_encrypted();

    Ok(Handshaked { socket: into_core(socket), handshake: theirs, encrypted })
}

/// Swap the handshake codec for the core codec, keeping whatever was already
/// buffered.
fn into_core(socket: Framed<PeerStream, HandshakeCodec>) -> PeerSocket {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, CoreCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

/// Read the handshake of a connection accepted by the engine.
///
/// The first 20 bytes tell if the peer is starting a plaintext handshake or
/// an encrypted one. For the latter, the torrent is found by the hash of the
/// info hash that the peer sends.
pub(crate) async fn read_inbound(
    mut tcp: TcpStream,
    remote_addr: SocketAddr,
    info_hashes: &[InfoHash],
    policy: EncryptionPolicy,
) -> Result<InboundPeer, Error> {
    use tokio::io::AsyncReadExt;

    let mut prefix = [0u8; 20];
    tcp.read_exact(&mut prefix).await?;

    let stream = if encryption::is_plaintext_handshake(&prefix) {
        if policy == EncryptionPolicy::Required {
            return Err(Error::EncryptionRequired);
        }
        PeerStream::with_prefix(tcp, None, &prefix)
    } else {
        if policy == EncryptionPolicy::Disabled {
            return Err(Error::HandshakeInvalid);
        }
        let accepted = encryption::accept(
            &mut tcp,
            &prefix,
            info_hashes,
            policy.allows_plaintext(),
        )
        .await?;
        PeerStream::with_prefix(tcp, accepted.cipher, &accepted.initial_payload)
    };

    let mut socket = Framed::new(stream, HandshakeCodec);
    let handshake = socket.next().await.ok_or(Error::PeerClosedSocket)??;

    if !info_hashes.contains(&handshake.info_hash) {
        return Err(Error::TorrentDoesNotExist);
    }

    Ok(InboundPeer { socket, handshake, remote_addr })
}
