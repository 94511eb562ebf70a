use std::io;

use thiserror::Error;

/// Errors surfaced by the frame exchange.
///
/// All of these are recoverable at the caller; the exchange has no fatal
/// error paths.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Every receiver handle has been dropped; the payload was not copied.
    #[error("no receivers")]
    NoReceivers,

    /// The sender handle has been dropped; no further frames will arrive.
    #[error("sender closed")]
    SenderClosed,

    /// The pool is saturated at [`MAX_SEGMENTS`](crate::ring::MAX_SEGMENTS);
    /// the clone was not created and the parent receiver remains valid.
    #[error("maximum number of receivers reached")]
    MaxReceivers,
}

/// Errors raised by the socket server and its per-client sessions.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The client sent a frame that does not follow the wire protocol.
    #[error("invalid request")]
    InvalidRequest,

    /// The client stopped heartbeating and is presumed dead.
    #[error("client timeout")]
    ClientTimeout,

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
