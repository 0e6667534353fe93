use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{disk::DiskMsg, engine::EngineMsg, peer::PeerMsg, torrent::TorrentMsg};

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

/// The broad class of an [`Error`], used to decide who gets to see it.
///
/// Parse errors go back to the caller, protocol errors and timeouts only close
/// the offending connection, and IO errors move the session into the error
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Protocol,
    HashMismatch,
    Io,
    NetworkTimeout,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("The metainfo is not valid: {0}")]
    MetaInfoInvalid(String),

    #[error("Error when reading magnet link")]
    MagnetError(#[from] magnet_url::MagnetError),

    #[error(
        "Your magnet does not have an info_hash, are you sure you copied the \
         entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error("`{0}` is not a valid IP address")]
    IpInvalid(String),

    #[error("The proxy configuration is not valid: {0}")]
    ProxyInvalid(String),

    #[error("The proxy refused the connection: {0}")]
    ProxyFailed(String),

    #[error("String is not UTF-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Could not read the TOML file: {0}")]
    TomlDeError(#[from] toml::de::Error),

    #[error("Could not write the TOML file: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    #[error("The resume data is not valid")]
    ResumeInvalid,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer took to long to accept the connection")]
    ConnectTimeout,

    #[error("The request took to long to arrive")]
    RequestTimeout,

    #[error("The peer took to long to respond")]
    Timeout,

    #[error("The message received from the peer is not valid")]
    MessageResponse,

    #[error("The peer sent a message of {0} bytes, which is too large")]
    MessageTooLarge(u32),

    #[error("The encrypted handshake failed: {0}")]
    EncryptionFailed(String),

    #[error("The peer does not support encryption, which is required")]
    EncryptionRequired,

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The address is blocked by the IP filter")]
    PeerBlocked,

    #[error("The torrent closed the connection")]
    PeerCancelled,

    #[error("The piece downloaded does not have a valid hash")]
    PieceInvalid,

    #[error("Could not find torrent for the given id")]
    TorrentDoesNotExist,

    #[error("The torrent does not have its metadata yet")]
    NoMetadata,

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    NoDuplicateTorrent,

    #[error(
        "Could not open the file `{0}`. Please make sure the program has \
         permission to access it"
    )]
    FileOpenError(String),

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("Could not send message to Disk")]
    SendErrorDisk(#[from] mpsc::error::SendError<DiskMsg>),

    #[error("Could not send message to Peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<PeerMsg>),

    #[error("Could not send message to Torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),

    #[error("Could not send message to the Engine")]
    SendErrorEngine(#[from] mpsc::error::SendError<EngineMsg>),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BencodeError
            | Self::MetaInfoInvalid(_)
            | Self::MagnetError(_)
            | Self::MagnetNoInfoHash
            | Self::IpInvalid(_)
            | Self::ProxyInvalid(_)
            | Self::Utf8Error(_)
            | Self::TomlDeError(_)
            | Self::TomlSerError(_)
            | Self::ResumeInvalid
            | Self::SpeedyError(_) => ErrorKind::Parse,

            Self::HandshakeInvalid
            | Self::MessageResponse
            | Self::MessageTooLarge(_)
            | Self::EncryptionFailed(_)
            | Self::EncryptionRequired
            | Self::PeerClosedSocket
            | Self::PeerBlocked
            | Self::PeerCancelled
            | Self::ProxyFailed(_) => ErrorKind::Protocol,

            Self::PieceInvalid => ErrorKind::HashMismatch,

            Self::IO(_)
            | Self::FileOpenError(_)
            | Self::FolderOpenError(_)
            | Self::HomeInvalid => ErrorKind::Io,

            Self::HandshakeTimeout
            | Self::ConnectTimeout
            | Self::RequestTimeout
            | Self::Timeout => ErrorKind::NetworkTimeout,

            Self::TorrentDoesNotExist
            | Self::NoMetadata
            | Self::NoDuplicateTorrent
            | Self::SendErrorDisk(_)
            | Self::SendErrorPeer(_)
            | Self::SendErrorTorrent(_)
            | Self::SendErrorEngine(_)
            | Self::ReceiveErrorOneshot(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(Error::BencodeError.kind(), ErrorKind::Parse);
        assert_eq!(Error::HandshakeInvalid.kind(), ErrorKind::Protocol);
        assert_eq!(Error::PieceInvalid.kind(), ErrorKind::HashMismatch);
        assert_eq!(
            Error::IO(io::Error::new(io::ErrorKind::Other, "disk full")).kind(),
            ErrorKind::Io
        );
        assert_eq!(Error::RequestTimeout.kind(), ErrorKind::NetworkTimeout);
    }
}
