use std::io;

use thiserror::Error;

use crate::bencode_parser::DecodeError;
use crate::peer::PeerAddress;

/// The metadata file decoded but does not describe a usable single-file torrent.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("could not read torrent file: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has the wrong type: {source}")]
    WrongType {
        field: &'static str,
        source: DecodeError,
    },

    #[error("field '{0}' must not be zero or empty")]
    EmptyField(&'static str),

    #[error("pieces length {len} is not a multiple of {chunk}")]
    InvalidPiecesLength { len: usize, chunk: usize },

    #[error("{hashes} piece hashes do not cover {length} bytes in pieces of {piece_length}")]
    PieceCountMismatch {
        hashes: usize,
        length: u64,
        piece_length: u32,
    },
}

/// Transport failure while talking to a peer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: PeerAddress,
        source: io::Error,
    },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The peer spoke, but not the protocol we expect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake is {actual} bytes, expected {expected}")]
    HandshakeLength { expected: usize, actual: usize },

    #[error("peer answered the handshake for a different torrent")]
    InfoHashMismatch,

    #[error("message frame is {actual} bytes, expected {expected}")]
    FrameLength { expected: usize, actual: usize },

    #[error("frame of {0} bytes exceeds the allowed maximum")]
    FrameTooLarge(usize),

    #[error("length prefix of {0} bytes is outside 0..=4")]
    PrefixLength(usize),

    #[error("{kind} payload has invalid length {len}")]
    Payload { kind: &'static str, len: usize },

    #[error("expected a {expected} message, got {found}")]
    UnexpectedMessage {
        expected: &'static str,
        found: &'static str,
    },

    #[error("block for piece {index} at {begin}+{len} does not fit the piece in progress")]
    UnexpectedBlock { index: u32, begin: u32, len: usize },
}

/// Anything that ends a peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        PeerError::Network(NetworkError::Io(err))
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker answered with status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed tracker response: {0}")]
    Decode(#[from] DecodeError),

    #[error("tracker refused the announce: {0}")]
    Failure(String),

    #[error("tracker response has no peer list")]
    MissingPeers,

    #[error("compact peer list of {0} bytes is not a multiple of 6")]
    InvalidPeers(usize),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peers to download from")]
    NoPeers,

    #[error("every peer left after {done} of {total} pieces")]
    Stalled { done: usize, total: usize },
}

/// Top-level error for a complete run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
