//! Mapping between [`TransferError`] and gRPC status codes.

use ferry::TransferError;
use tonic::{Code, Status};

/// Convert a transfer error into the status sent to the peer.
pub fn to_status(err: TransferError) -> Status {
    match err {
        TransferError::NotFound(name) => Status::not_found(format!("file not found: {name}")),
        TransferError::Unauthenticated(msg) => Status::unauthenticated(msg),
        TransferError::DeadlineExceeded(msg) => Status::deadline_exceeded(msg),
        TransferError::Internal(msg) => Status::internal(msg),
        TransferError::InvalidArgument(msg) => Status::invalid_argument(msg),
        TransferError::ChannelClosed => Status::cancelled("stream closed by peer"),
        TransferError::Transport(msg) => Status::unavailable(msg),
        TransferError::Unknown { message, .. } => Status::unknown(message),
    }
}

/// Convert a status received from the peer into a transfer error.
pub fn from_status(status: Status) -> TransferError {
    let message = status.message().to_string();
    match status.code() {
        Code::NotFound => TransferError::NotFound(message),
        Code::Unauthenticated => TransferError::Unauthenticated(message),
        Code::DeadlineExceeded => TransferError::DeadlineExceeded(message),
        Code::Internal => TransferError::Internal(message),
        Code::InvalidArgument => TransferError::InvalidArgument(message),
        Code::Cancelled => TransferError::ChannelClosed,
        Code::Unavailable => TransferError::Transport(message),
        code => TransferError::Unknown {
            code: code as i32,
            message,
        },
    }
}

/// Convert a failure while reading a request stream into a transfer error.
///
/// Only cancellation and deadlines keep their meaning; anything else the
/// transport reports is internal to this side of the call.
pub fn from_request_status(status: Status) -> TransferError {
    match status.code() {
        Code::Cancelled => TransferError::ChannelClosed,
        Code::DeadlineExceeded => TransferError::DeadlineExceeded(status.message().to_string()),
        _ => TransferError::Internal(status.message().to_string()),
    }
}
