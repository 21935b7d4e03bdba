//! # Download Errors
//!
//! Two layers of failure exist in the swarm engine:
//!
//! - [`PeerError`]: anything that goes wrong with one peer. These are always
//!   contained inside the worker that owns the peer and never abort siblings.
//! - [`DownloadError`]: the only failures surfaced to the caller of the engine.
//!
//! Peer discovery fails separately with a [`TrackerError`].

use std::io;

use thiserror::Error;

/// Failure of a single peer connection or of one of its chunks.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer is unreachable or refused the connection.
    #[error("could not connect to peer: {0}")]
    Connect(#[source] io::Error),

    /// The peer answered with a malformed handshake or for another torrent.
    #[error("invalid handshake: {0}")]
    Handshake(String),

    /// No data within the configured bound.
    #[error("peer timed out")]
    Timeout,

    /// Protocol violation in a length-prefixed frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A chunk downloaded from the peer did not match its expected digest.
    #[error("integrity check failed for piece {0}")]
    IntegrityMismatch(u32),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl PeerError {
    /// Classify an I/O error raised while reading or writing a frame.
    pub fn from_frame_io(err: io::Error) -> PeerError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => PeerError::Timeout,
            io::ErrorKind::UnexpectedEof => {
                PeerError::MalformedFrame("connection closed in the middle of a frame".into())
            }
            _ => PeerError::Io(err),
        }
    }
}

/// Fatal outcome of a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Every worker terminated while some pieces were still unverified.
    #[error("download incomplete: {missing} of {total} pieces could not be retrieved")]
    Incomplete { missing: usize, total: usize },

    /// The download could not start at all.
    #[error("cannot start download: {0}")]
    PreconditionFailed(String),
}

/// Failure to obtain peers from the trackers.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("could not parse tracker url: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not decode tracker response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// The tracker refused the announce.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("malformed compact peer list")]
    MalformedPeers,

    #[error("could not get peers from any tracker")]
    NoPeers,
}
