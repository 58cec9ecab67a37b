//! The crate's error taxonomy.
//!
//! Errors are grouped by the component that raises them, mirroring the
//! propagation policy in the design: peer and tracker errors are local to a
//! single connection and never escape their owning task; disk errors bubble
//! up to the torrent that owns the failing write; only a handful of
//! conditions (`EngineError`) are fatal to an entire download.

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors arising while parsing a metainfo file.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("`pieces` length {0} is not a multiple of 20")]
    InvalidPiecesLength(usize),
    #[error("torrent info has neither `length` nor `files`")]
    MissingFileLength,
    #[error("file path component is empty")]
    EmptyFilePath,
}

/// Errors local to a single peer connection.
///
/// None of these ever propagate past the session that produced them: the
/// session simply ends and the swarm may replace it with a fresh candidate.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake protocol string mismatch")]
    HandshakeMismatch,
    #[error("peer's info hash does not match this torrent")]
    InvalidInfoHash,
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("frame length {0} exceeds the maximum allowed frame size")]
    FrameTooLarge(u32),
    #[error("peer sent a bitfield message outside of the availability exchange")]
    BitfieldNotAfterHandshake,
    #[error("too many consecutive i/o errors")]
    TooManyErrors,
    #[error("no frame received within the inactivity timeout")]
    InactivityTimeout,
    #[error("piece engine error: {0}")]
    Disk(#[from] DiskError),
}

/// Errors raised by [`crate::disk`]'s file mapper or [`crate::piece`]'s piece
/// engine.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("piece index {0} is invalid for this torrent")]
    InvalidPieceIndex(usize),
    #[error("too many pieces are in progress at once")]
    TooManyInProgress,
}

/// Errors raised by the tracker client.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("udp tracker i/o error: {0}")]
    Udp(std::io::Error),
    #[error("bencode decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("malformed compact peer list")]
    MalformedPeers,
    #[error("tracker did not respond after {0} attempts")]
    NoResponse(usize),
    #[error("udp tracker response had a mismatched transaction id")]
    MismatchedTransaction,
    #[error("invalid tracker url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported tracker url scheme: {0}")]
    UnsupportedScheme(String),
}

/// Fatal, whole-download errors.
///
/// Everything else (a single peer's errors, a single tracker's
/// unreachability, a piece's hash mismatch) is recovered from locally.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed metainfo: {0}")]
    Metainfo(#[from] MetainfoError),
    #[error("no tracker (primary or announce-list alternate) is reachable")]
    TrackerUnreachable,
    #[error("swarm stalled: {0} recovery rounds exhausted with no progress")]
    SwarmStalled(usize),
    #[error("disk i/o failure: {0}")]
    Disk(#[from] DiskError),
}
