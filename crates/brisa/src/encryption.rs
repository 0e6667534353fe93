//! Message stream encryption (MSE/PE).
//!
//! An obfuscation layer negotiated before the BitTorrent handshake: a
//! Diffie-Hellman exchange over a fixed 768 bit prime, followed by RC4 streams
//! keyed with the shared secret and the info hash. The initiator sends its
//! BitTorrent handshake as the initial payload (IA) of the negotiation, and
//! the responder finds the torrent by matching the obfuscated info hash
//! against the torrents it knows.
//!
//! After the negotiation, the socket is wrapped in a [`PeerStream`], which
//! encrypts and decrypts transparently, so the codecs never know if the
//! connection is encrypted or not.

use std::{
    io,
    pin::Pin,
    str::FromStr,
    task::{ready, Context, Poll},
};

use bytes::{Buf, BytesMut};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tracing::debug;

use crate::{error::Error, extensions::core::PSTR, torrent::InfoHash};

/// When and how connections are encrypted.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Plaintext only, encrypted handshakes are refused.
    Disabled,
    /// Outbound connections try to encrypt and fall back to plaintext,
    /// inbound connections may use either.
    #[default]
    Enabled,
    /// Only encrypted connections.
    Required,
}

impl EncryptionPolicy {
    /// If the RC4 stream may be declined in favour of plaintext.
    pub fn allows_plaintext(&self) -> bool {
        *self != Self::Required
    }
}

impl From<EncryptionPolicy> for u8 {
    fn from(value: EncryptionPolicy) -> Self {
        match value {
            EncryptionPolicy::Disabled => 0,
            EncryptionPolicy::Enabled => 1,
            EncryptionPolicy::Required => 2,
        }
    }
}

impl From<u8> for EncryptionPolicy {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Disabled,
            2 => Self::Required,
            _ => Self::Enabled,
        }
    }
}

impl FromStr for EncryptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "enabled" => Ok(Self::Enabled),
            "required" => Ok(Self::Required),
            _ => Err(format!("unknown encryption policy: {s}")),
        }
    }
}

impl std::fmt::Display for EncryptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Required => "required",
        };
        f.write_str(s)
    }
}

const PRIME: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x20, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Length of the public keys on the wire.
const KEY_LEN: usize = 96;

/// Verification constant.
const VC: [u8; 8] = [0; 8];

const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Maximum length of PadA, PadB, PadC and PadD.
const MAX_PAD: usize = 512;

/// Keystream bytes dropped before use.
const RC4_DISCARD: usize = 1024;

struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        let mut rc4 = Self { s, i: 0, j: 0 };
        rc4.discard(RC4_DISCARD);
        rc4
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx =
                self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[idx as usize];
        }
    }

    fn discard(&mut self, count: usize) {
        let mut buf = vec![0u8; count];
        self.apply(&mut buf);
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rc4")
    }
}

/// The two RC4 streams of an encrypted connection.
#[derive(Debug)]
pub struct CipherState {
    enc: Rc4,
    dec: Rc4,
}

impl CipherState {
    fn new(enc_key: &[u8], dec_key: &[u8]) -> Self {
        Self { enc: Rc4::new(enc_key), dec: Rc4::new(dec_key) }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.enc.apply(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.dec.apply(data);
    }
}

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut sha = sha1_smol::Sha1::new();
    for part in parts {
        sha.update(part);
    }
    sha.digest().bytes()
}

fn xor(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn to_fixed_bytes(value: &BigUint) -> [u8; KEY_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; KEY_LEN];
    let len = bytes.len().min(KEY_LEN);
    out[KEY_LEN - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    out
}

/// A Diffie-Hellman key pair.
struct KeyPair {
    private: BigUint,
    public: [u8; KEY_LEN],
}

impl KeyPair {
    fn generate() -> Self {
        let private: [u8; 20] = rand::random();
        let private = BigUint::from_bytes_be(&private);
        let public = BigUint::from(2u8).modpow(&private, &prime());
        Self { private, public: to_fixed_bytes(&public) }
    }

    /// Compute the shared secret, rejecting degenerate public keys.
    fn shared_secret(&self, remote: &[u8]) -> Result<[u8; KEY_LEN], Error> {
        let p = prime();
        let remote = BigUint::from_bytes_be(remote);
        if remote.is_zero() || remote.is_one() || remote >= &p - BigUint::one() {
            return Err(Error::EncryptionFailed("invalid public key".into()));
        }
        Ok(to_fixed_bytes(&remote.modpow(&self.private, &p)))
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

fn random_pad() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=MAX_PAD);
    (0..len).map(|_| rng.gen()).collect()
}

/// Read until `pattern` was read, giving up after `max` bytes.
async fn sync_on(
    stream: &mut TcpStream,
    pattern: &[u8],
    max: usize,
) -> Result<(), Error> {
    let mut window = Vec::with_capacity(max);
    loop {
        window.push(stream.read_u8().await?);
        if window.ends_with(pattern) {
            return Ok(());
        }
        if window.len() >= max {
            return Err(Error::EncryptionFailed("could not synchronize".into()));
        }
    }
}

/// Run the MSE handshake as the initiator of the connection, with our
/// BitTorrent handshake as the initial payload.
///
/// Returns the cipher, or `None` if the remote selected plaintext.
pub async fn initiate(
    stream: &mut TcpStream,
    info_hash: &InfoHash,
    allow_plaintext: bool,
    initial_payload: &[u8],
) -> Result<Option<CipherState>, Error> {
    let keys = KeyPair::generate();

    // 1 A->B: Diffie Hellman Ya, PadA
    let mut out = keys.public.to_vec();
    out.extend(random_pad());
    stream.write_all(&out).await?;

    // 2 B->A: Diffie Hellman Yb, PadB
    let mut yb = [0u8; KEY_LEN];
    stream.read_exact(&mut yb).await?;
    let s = keys.shared_secret(&yb)?;

    let key_a = hash(&[b"keyA", &s, &info_hash.0]);
    let key_b = hash(&[b"keyB", &s, &info_hash.0]);
    let mut cipher = CipherState::new(&key_a, &key_b);

    // 3 A->B: HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S),
    // ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
    let mut provide = CRYPTO_RC4;
    if allow_plaintext {
        provide |= CRYPTO_PLAINTEXT;
    }
    let mut payload = Vec::with_capacity(16 + initial_payload.len());
    payload.extend_from_slice(&VC);
    payload.extend_from_slice(&provide.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&(initial_payload.len() as u16).to_be_bytes());
    payload.extend_from_slice(initial_payload);
    cipher.encrypt(&mut payload);

    let mut out = hash(&[b"req1", &s]).to_vec();
    out.extend_from_slice(&xor(
        &hash(&[b"req2", &info_hash.0]),
        &hash(&[b"req3", &s]),
    ));
    out.extend(payload);
    stream.write_all(&out).await?;

    // 4 B->A: ENCRYPT(VC, crypto_select, len(padD), padD)
    // the VC is found by encrypting it with a copy of the decrypting stream,
    // PadB comes before it.
    let mut vc = VC;
    Rc4::new(&key_b).apply(&mut vc);
    sync_on(stream, &vc, MAX_PAD + VC.len()).await?;
    cipher.decrypt(&mut vc);

    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    cipher.decrypt(&mut header);
    let select = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let pad_d = u16::from_be_bytes([header[4], header[5]]) as usize;
    if pad_d > MAX_PAD {
        return Err(Error::EncryptionFailed("PadD is too long".into()));
    }
    let mut pad = vec![0u8; pad_d];
    stream.read_exact(&mut pad).await?;
    cipher.decrypt(&mut pad);

    if select == CRYPTO_RC4 {
        Ok(Some(cipher))
    } else if select == CRYPTO_PLAINTEXT && allow_plaintext {
        Ok(None)
    } else {
        Err(Error::EncryptionFailed(format!("invalid crypto_select {select}")))
    }
}

/// The outcome of an MSE handshake where we are the responder.
#[derive(Debug)]
pub struct Accepted {
    /// `None` if we selected plaintext.
    pub cipher: Option<CipherState>,
    /// The torrent that the initiator wants.
    pub info_hash: InfoHash,
    /// The decrypted initial payload, the BitTorrent handshake of the peer.
    pub initial_payload: Vec<u8>,
}

/// Run the MSE handshake as the responder. `prefix` are the bytes of Ya that
/// were already read to detect the kind of handshake.
pub async fn accept(
    stream: &mut TcpStream,
    prefix: &[u8],
    info_hashes: &[InfoHash],
    allow_plaintext: bool,
) -> Result<Accepted, Error> {
    // 1 A->B: Diffie Hellman Ya, PadA
    let mut ya = [0u8; KEY_LEN];
    ya[..prefix.len()].copy_from_slice(prefix);
    stream.read_exact(&mut ya[prefix.len()..]).await?;

    let keys = KeyPair::generate();
    let s = keys.shared_secret(&ya)?;

    // 2 B->A: Diffie Hellman Yb, PadB
    let mut out = keys.public.to_vec();
    out.extend(random_pad());
    stream.write_all(&out).await?;

    // 3 A->B: HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S), ...
    // PadA comes before it.
    sync_on(stream, &hash(&[b"req1", &s]), MAX_PAD + 20).await?;

    let mut obfuscated = [0u8; 20];
    stream.read_exact(&mut obfuscated).await?;
    let req2 = xor(&obfuscated, &hash(&[b"req3", &s]));
    let info_hash = info_hashes
        .iter()
        .find(|h| hash(&[b"req2", &h.0]) == req2)
        .copied()
        .ok_or_else(|| Error::EncryptionFailed("unknown info hash".into()))?;

    let key_a = hash(&[b"keyA", &s, &info_hash.0]);
    let key_b = hash(&[b"keyB", &s, &info_hash.0]);
    let mut cipher = CipherState::new(&key_b, &key_a);

    // ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
    let mut header = [0u8; 14];
    stream.read_exact(&mut header).await?;
    cipher.decrypt(&mut header);
    if header[..8] != VC {
        return Err(Error::EncryptionFailed("invalid VC".into()));
    }
    let provide =
        u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let pad_c = u16::from_be_bytes([header[12], header[13]]) as usize;
    if pad_c > MAX_PAD {
        return Err(Error::EncryptionFailed("PadC is too long".into()));
    }
    let mut pad = vec![0u8; pad_c + 2];
    stream.read_exact(&mut pad).await?;
    cipher.decrypt(&mut pad);
    let ia_len = u16::from_be_bytes([pad[pad_c], pad[pad_c + 1]]) as usize;
    let mut initial_payload = vec![0u8; ia_len];
    stream.read_exact(&mut initial_payload).await?;
    cipher.decrypt(&mut initial_payload);

    let select = if provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if provide & CRYPTO_PLAINTEXT != 0 && allow_plaintext {
        CRYPTO_PLAINTEXT
    } else {
        return Err(Error::EncryptionFailed(format!(
            "no common crypto method in {provide}"
        )));
    };

    // 4 B->A: ENCRYPT(VC, crypto_select, len(padD), padD)
    let mut out = Vec::with_capacity(14);
    out.extend_from_slice(&VC);
    out.extend_from_slice(&select.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    cipher.encrypt(&mut out);
    stream.write_all(&out).await?;

    debug!("accepted encrypted connection for {info_hash:?}");

    Ok(Accepted {
        cipher: (select == CRYPTO_RC4).then_some(cipher),
        info_hash,
        initial_payload,
    })
}

/// If the first bytes read from an inbound connection are the start of a
/// plaintext BitTorrent handshake.
pub fn is_plaintext_handshake(prefix: &[u8]) -> bool {
    prefix.len() == 1 + PSTR.len()
        && prefix[0] as usize == PSTR.len()
        && prefix[1..] == PSTR
}

/// The socket of a peer. Bytes are encrypted and decrypted transparently if
/// the connection negotiated RC4.
#[derive(Debug)]
pub struct PeerStream {
    inner: TcpStream,
    cipher: Option<CipherState>,
    /// Bytes that were already read from the socket, and decrypted, before
    /// the stream was built.
    prefix: BytesMut,
    /// Encrypted bytes not yet written to the socket.
    pending: BytesMut,
}

impl PeerStream {
    pub fn plain(inner: TcpStream) -> Self {
        Self::with_prefix(inner, None, &[])
    }

    pub fn with_prefix(
        inner: TcpStream,
        cipher: Option<CipherState>,
        prefix: &[u8],
    ) -> Self {
        Self {
            inner,
            cipher,
            prefix: BytesMut::from(prefix),
            pending: BytesMut::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    fn poll_write_pending(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n =
                ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(cipher) = &mut this.cipher {
            cipher.decrypt(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.cipher.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, data);
        }

        // the keystream advances when the data is accepted, so it is only
        // accepted after the previous write reached the socket.
        ready!(this.poll_write_pending(cx))?;

        let start = this.pending.len();
        this.pending.extend_from_slice(data);
        if let Some(cipher) = &mut this.cipher {
            cipher.encrypt(&mut this.pending[start..]);
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn cipher_roundtrip() {
        let mut a = CipherState::new(b"keyA", b"keyB");
        let mut b = CipherState::new(b"keyB", b"keyA");
        let mut data = b"hello world".to_vec();
        a.encrypt(&mut data);
        assert_ne!(data, b"hello world");
        b.decrypt(&mut data);
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn fixed_bytes_are_left_padded() {
        let small = BigUint::from(0x1234u32);
        let bytes = to_fixed_bytes(&small);
        assert_eq!(bytes[..94], [0u8; 94]);
        assert_eq!(bytes[94..], [0x12, 0x34]);
    }

    #[test]
    fn shared_secret_agrees() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(
            a.shared_secret(&b.public).unwrap(),
            b.shared_secret(&a.public).unwrap()
        );
        assert!(a.shared_secret(&[0u8; 96]).is_err());
        assert!(a.shared_secret(&[1u8]).is_err());
    }

    #[test]
    fn detects_plaintext_handshake() {
        let mut prefix = vec![19u8];
        prefix.extend_from_slice(&PSTR);
        assert!(is_plaintext_handshake(&prefix));
        prefix[3] = b'x';
        assert!(!is_plaintext_handshake(&prefix));
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(
            "Required".parse::<EncryptionPolicy>(),
            Ok(EncryptionPolicy::Required)
        );
        assert!("maybe".parse::<EncryptionPolicy>().is_err());
        let p: u8 = EncryptionPolicy::Disabled.into();
        assert_eq!(EncryptionPolicy::from(p), EncryptionPolicy::Disabled);
    }

    #[tokio::test]
    async fn mse_over_tcp() -> Result<(), Error> {
        let info_hash = InfoHash([5u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut prefix = [0u8; 20];
            socket.read_exact(&mut prefix).await?;
            assert!(!is_plaintext_handshake(&prefix));

            let accepted = accept(
                &mut socket,
                &prefix,
                &[InfoHash([1u8; 20]), info_hash],
                false,
            )
            .await?;
            assert_eq!(accepted.info_hash, info_hash);
            assert_eq!(accepted.initial_payload, b"bt-handshake");

            let mut stream = PeerStream::with_prefix(
                socket,
                accepted.cipher,
                &accepted.initial_payload,
            );
            assert!(stream.is_encrypted());

            let mut ia = [0u8; 12];
            stream.read_exact(&mut ia).await?;
            assert_eq!(&ia, b"bt-handshake");

            stream.write_all(b"pong").await?;
            stream.flush().await?;
            let mut ping = [0u8; 4];
            stream.read_exact(&mut ping).await?;
            assert_eq!(&ping, b"ping");
            Ok::<_, Error>(())
        });

        let mut socket = TcpStream::connect(addr).await?;
        let cipher =
            initiate(&mut socket, &info_hash, false, b"bt-handshake").await?;
        let mut stream = PeerStream::with_prefix(socket, cipher, &[]);

        let mut pong = [0u8; 4];
        stream.read_exact(&mut pong).await?;
        assert_eq!(&pong, b"pong");
        stream.write_all(b"ping").await?;
        stream.flush().await?;

        server.await.unwrap()?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_info_hash_is_rejected() -> Result<(), Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            accept(&mut socket, &[], &[InfoHash([1u8; 20])], true).await
        });

        let mut socket = TcpStream::connect(addr).await?;
        let client = initiate(&mut socket, &InfoHash([2; 20]), true, b"").await;

        assert!(server.await.unwrap().is_err());
        // the responder closes the socket without answering
        assert!(client.is_err());
        Ok(())
    }
}
