//! Errors surfaced to bus users.
//!
//! Control-plane failures arrive as response codes inside ordinary replies;
//! [`BusError::from_code`] turns a non-OK code into the matching variant so
//! callers see one error type whether the failure was local or remote.

use std::time::Duration;

use crate::control::{ControlError, ResponseCode};
use crate::message::MessageError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed control payload: {0}")]
    Malformed(#[from] ControlError),

    #[error("payload codec: {0}")]
    Codec(#[from] MessageError),

    /// DUPLICATE or VERSION_MISMATCH.
    #[error("registry conflict: {0}")]
    Conflict(ResponseCode),

    /// NOT_PUBLISHED.
    #[error("`{0}` is not published")]
    NotFound(String),

    #[error("type mismatch: expected type {expected}, got {actual}")]
    TypeMismatch { expected: u32, actual: u32 },

    /// Any other non-OK reply, most often INVALID.
    #[error("request rejected: {0}")]
    Rejected(ResponseCode),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("runtime is already initialized")]
    AlreadyInitialized,

    #[error("runtime is not initialized")]
    NotInitialized,

    #[error("topic `{0}` is not advertised by this runtime")]
    NotAdvertised(String),
}

impl BusError {
    /// Map a reply's response code. `OK` is success; `subject` names the
    /// topic or method the request was about.
    pub fn from_code(code: ResponseCode, subject: &str) -> Result<(), BusError> {
        match code {
            ResponseCode::Ok => Ok(()),
            ResponseCode::Duplicate | ResponseCode::VersionMismatch => {
                Err(BusError::Conflict(code))
            }
            ResponseCode::NotPublished => Err(BusError::NotFound(subject.to_string())),
            ResponseCode::Invalid => Err(BusError::Rejected(code)),
        }
    }

    /// The control-plane code this error carries, if it came from a reply.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            BusError::Conflict(c) | BusError::Rejected(c) => Some(*c),
            BusError::NotFound(_) => Some(ResponseCode::NotPublished),
            _ => None,
        }
    }
}
