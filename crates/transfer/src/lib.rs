//! Payload hashing, chunk planning and transfer status.
//!
//! Everything in here is transport-agnostic: the block-stream and HTTP
//! strategies in `pixelflash-engine` read payloads through [`ChunkReader`],
//! prove integrity with [`Digest`], and publish progress through
//! [`StatusReporter`].

mod chunked;
mod progress;
mod types;
mod validation;

pub use chunked::{
    ChunkReader, chunk_count, chunk_spans, digest_bytes, digest_payload, digest_reader,
};
pub use progress::{SpeedCalculator, StatusReporter, StatusSnapshot};
pub use types::{Chunk, Digest, Payload, PayloadReader, TransferPhase};
pub use validation::{validate_endpoint_path, validate_payload};

/// Default chunk size: 32 KiB.
///
/// Sized for an ESP-01 class device, which has roughly 40 KiB of heap
/// for the whole HTTP stack. Engines targeting other devices override it.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Read size used when streaming a payload through SHA-256.
pub const DIGEST_BLOCK_SIZE: usize = 4096;

/// SHA-256 digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("payload length mismatch: declared {declared} bytes, read {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("{len} bytes need more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { len: u64, chunk_size: usize },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid endpoint path: {0}")]
    InvalidPath(String),
}
