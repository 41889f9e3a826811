//! Protocol-level error taxonomy.
//!
//! Each concern keeps its own error type next to the code that raises it
//! (`FramingError` in `wire`, `CryptoError` in `crypto`). `ProtocolError`
//! is what handlers return, and it decides whether the connection survives.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::integrity::Checksum;
use crate::wire::FramingError;

/// Read/write failure, timeout or peer close. Never retried at this layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("framing: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("checksum mismatch on attempt {attempt}: local {local}, remote {remote}")]
    IntegrityMismatch {
        attempt: u8,
        local: Checksum,
        remote: Checksum,
    },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Server-side failure unrelated to the peer's behaviour, such as storage I/O.
    #[error("internal: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn violation(msg: impl Into<String>) -> Self {
        ProtocolError::Violation(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Framing(_) => ErrorCode::Framing,
            ProtocolError::Violation(_) => ErrorCode::Violation,
            ProtocolError::Crypto(_) => ErrorCode::Crypto,
            ProtocolError::IntegrityMismatch { .. } => ErrorCode::Integrity,
            ProtocolError::Transport(_) => ErrorCode::Transport,
            ProtocolError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Everything except an integrity mismatch ends the connection.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, ProtocolError::IntegrityMismatch { .. })
    }
}

/// Error category carried in a `GeneralError` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Framing = 1,
    Violation = 2,
    Crypto = 3,
    Integrity = 4,
    Transport = 5,
    Internal = 6,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            1 => ErrorCode::Framing,
            2 => ErrorCode::Violation,
            3 => ErrorCode::Crypto,
            4 => ErrorCode::Integrity,
            5 => ErrorCode::Transport,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        code as u8
    }
}
