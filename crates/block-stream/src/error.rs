//! Error types for the block stream.

use std::fmt;

/// The frame an acknowledgement was expected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStage {
    Header,
    Block(u32),
}

impl fmt::Display for AckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStage::Header => f.write_str("session header"),
            AckStage::Block(i) => write!(f, "block {i}"),
        }
    }
}

/// Errors produced by the block stream sender and receiver.
#[derive(Debug, thiserror::Error)]
pub enum BlockStreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    ConnectTimeout,

    #[error("no ACK for {0} within timeout")]
    AckTimeout(AckStage),

    #[error("device rejected {stage} (0x{byte:02x})")]
    Nak { stage: AckStage, byte: u8 },

    #[error("connection closed while waiting for ACK for {0}")]
    Closed(AckStage),

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BlockStreamError {
    /// Whether a fresh stream attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BlockStreamError::Cancelled | BlockStreamError::Protocol(_))
    }
}
