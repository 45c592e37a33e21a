//! Error types for the control channel, the data channel and the client.

use std::time::Duration;

use crate::checksum::Checksum;
use crate::protocol::status;

/// Failures while framing or unframing one control message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Peer closed before the sentinel arrived; the request is abandoned.
    #[error("connection closed before end of message")]
    Closed,

    #[error("no complete message within {0:?}")]
    Timeout(Duration),

    #[error("message exceeds {0} bytes without a terminator")]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A request the server refuses. Each variant maps to exactly one status.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Malformed(String),

    #[error("{0} is not a valid command.")]
    UnknownCommand(String),

    #[error("{0}")]
    Sandbox(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl RequestError {
    pub fn status(&self) -> u16 {
        match self {
            RequestError::Malformed(_) | RequestError::UnknownCommand(_) => status::BAD_REQUEST,
            RequestError::Sandbox(_) | RequestError::Conflict(_) => status::FORBIDDEN,
            RequestError::NotFound(_) => status::NOT_FOUND,
            RequestError::Internal(_) => status::INTERNAL,
        }
    }
}

/// Why a data channel ended without completing. Never reported to the peer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("peer closed the connection after {received} of {expected} bytes")]
    PeerDropped { received: u64, expected: u64 },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("received more than the declared {expected} bytes")]
    Overrun { expected: u64 },

    #[error("checksum {actual} does not match declared checksum {expected}")]
    ChecksumMismatch { expected: Checksum, actual: Checksum },

    #[error("destination {0} appeared before commit")]
    Exists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A non-200 response as seen by the client.
#[derive(Debug, thiserror::Error)]
#[error("Error code: {status}\n\t{message}")]
pub struct ServerError {
    pub status: u16,
    pub message: String,
}
