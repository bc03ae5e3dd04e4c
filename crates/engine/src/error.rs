//! Engine error types.

use serde::{Deserialize, Serialize};

/// Errors talking to a device over HTTP or probing its OTA port.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("endpoint not configured: {0}")]
    MissingEndpoint(&'static str),
}

impl DeviceError {
    /// Maps a reqwest failure, keeping timeouts distinct.
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeviceError::Timeout
        } else {
            DeviceError::Http(e)
        }
    }
}

/// Category of a failed session, one per terminal failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Concurrency,
    Unreachable,
    Transport,
    VerificationMismatch,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Transport => "transport",
            ErrorKind::VerificationMismatch => "verification_mismatch",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("another transfer is active (session {0})")]
    Concurrency(String),

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("verification mismatch: local {local}, device {remote}")]
    VerificationMismatch { local: String, remote: String },

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Concurrency(_) => ErrorKind::Concurrency,
            EngineError::Unreachable(_) => ErrorKind::Unreachable,
            EngineError::Transport(_) => ErrorKind::Transport,
            EngineError::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<pixelflash_transfer::TransferError> for EngineError {
    fn from(e: pixelflash_transfer::TransferError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
