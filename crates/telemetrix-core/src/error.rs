use crate::types::Space;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Caller errors, raised before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{space} {id} is not configured")]
    NotConfigured { space: Space, id: u8 },

    // Reply errors
    #[error("Timed out after {duration_ms}ms waiting for {awaiting}")]
    Timeout {
        awaiting: &'static str,
        duration_ms: u64,
    },

    #[error("Busy: a {0} request is already outstanding")]
    Busy(&'static str),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    // Link errors
    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the session can no longer make progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TransportLost(_))
    }
}

/// Reason a run of incoming bytes was rejected by the decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameErrorKind {
    #[error("implausible frame length {0}")]
    BadLength(u8),

    #[error("unknown report type {0:#04x}")]
    UnknownReportType(u8),

    #[error("report type {report_type:#04x} cannot carry length {length}")]
    LengthMismatch { report_type: u8, length: u8 },

    #[error("malformed payload for report type {report_type:#04x}: {reason}")]
    MalformedPayload {
        report_type: u8,
        reason: &'static str,
    },
}

/// Malformed incoming data, recovered by discarding bytes.
///
/// `kind` is the first rejection of a resynchronization run and `discarded`
/// the total number of bytes dropped before the decoder found the next
/// plausible frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} ({discarded} byte(s) discarded)")]
pub struct FrameError {
    pub kind: FrameErrorKind,
    pub discarded: usize,
}

impl FrameError {
    #[must_use]
    pub fn new(kind: FrameErrorKind, discarded: usize) -> Self {
        Self { kind, discarded }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
