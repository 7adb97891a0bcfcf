//! Error taxonomy shared by transfer sessions and clients

use thiserror::Error;

/// Result alias for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can terminate a transfer call.
///
/// The first six variants form the vocabulary a caller can rely on to tell
/// failures apart. `Transport` and `Unknown` cover everything the peer or the
/// connection reports outside of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The requested blob does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Missing or invalid credential
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The caller's deadline elapsed mid-call
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// I/O failure on the store or the stream
    #[error("internal error: {0}")]
    Internal(String),
    /// Malformed request
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Send attempted after the peer or transport ended the stream
    #[error("channel closed")]
    ChannelClosed,
    /// Connection could not be established or was lost
    #[error("transport error: {0}")]
    Transport(String),
    /// Status code outside the known vocabulary
    #[error("unknown error (code {code}): {message}")]
    Unknown {
        /// Raw status code reported by the peer
        code: i32,
        /// Message reported by the peer
        message: String,
    },
}

impl TransferError {
    /// Short stable name of the error kind, for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::NotFound(_) => "not_found",
            TransferError::Unauthenticated(_) => "unauthenticated",
            TransferError::DeadlineExceeded(_) => "deadline_exceeded",
            TransferError::Internal(_) => "internal",
            TransferError::InvalidArgument(_) => "invalid_argument",
            TransferError::ChannelClosed => "channel_closed",
            TransferError::Transport(_) => "transport",
            TransferError::Unknown { .. } => "unknown",
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Internal(err.to_string())
    }
}
