//! Engine tuning.
//!
//! Sizes and thresholds follow the memory budget of the target device; the
//! defaults suit an ESP-01 class module.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Engine configuration. Every field has a default, so partial TOML
/// documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Payloads up to this size go out in a single request.
    #[serde(default = "default_chunk_budget")]
    pub small_file_threshold: u64,

    /// Per-request chunk size for chunked uploads.
    #[serde(default = "default_chunk_budget_usize")]
    pub chunk_size: usize,

    /// Absolute payload ceiling.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u64,

    /// Attempts per request, chunk or stream (first try included).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,

    /// OTA connect timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// OTA per-frame ACK timeout.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// OTA block size.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Pad the final OTA block with 0xFF.
    #[serde(default = "default_true")]
    pub pad_final_block: bool,

    /// Read size for local hashing.
    #[serde(default = "default_digest_block_size")]
    pub digest_block_size: usize,
}

fn default_chunk_budget() -> u64 {
    pixelflash_transfer::DEFAULT_CHUNK_SIZE as u64
}

fn default_chunk_budget_usize() -> usize {
    pixelflash_transfer::DEFAULT_CHUNK_SIZE
}

fn default_max_payload_size() -> u64 {
    4 * 1024 * 1024
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_verify_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_block_size() -> usize {
    pixelflash_block_stream::DEFAULT_BLOCK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_digest_block_size() -> usize {
    pixelflash_transfer::DIGEST_BLOCK_SIZE
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: default_chunk_budget(),
            chunk_size: default_chunk_budget_usize(),
            max_payload_size: default_max_payload_size(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            block_size: default_block_size(),
            pad_final_block: default_true(),
            digest_block_size: default_digest_block_size(),
        }
    }
}

impl EngineConfig {
    /// Rejects zero sizes, attempts and timeouts, and chunk or block sizes
    /// too small to index `max_payload_size` with a `u32`.
    pub fn validate(&self) -> Result<(), EngineError> {
        let checks = [
            (self.chunk_size == 0, "chunk_size"),
            (self.max_payload_size == 0, "max_payload_size"),
            (self.retry_attempts == 0, "retry_attempts"),
            (self.block_size == 0, "block_size"),
            (self.digest_block_size == 0, "digest_block_size"),
            (self.probe_timeout_ms == 0, "probe_timeout_ms"),
            (self.request_timeout_ms == 0, "request_timeout_ms"),
            (self.verify_timeout_ms == 0, "verify_timeout_ms"),
            (self.connect_timeout_ms == 0, "connect_timeout_ms"),
            (self.ack_timeout_ms == 0, "ack_timeout_ms"),
        ];
        if let Some((_, field)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(EngineError::Validation(format!("{field} must be > 0")));
        }
        if self.block_size > u32::MAX as usize {
            return Err(EngineError::Validation("block_size too large".into()));
        }
        if pixelflash_transfer::chunk_count(self.max_payload_size, self.chunk_size).is_err() {
            return Err(EngineError::Validation(
                "chunk_size too small for max_payload_size".into(),
            ));
        }
        let blocks =
            pixelflash_block_stream::wire::block_count(self.max_payload_size, self.block_size);
        if blocks.is_none() {
            return Err(EngineError::Validation(
                "block_size too small for max_payload_size".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// OTA sender options derived from this config.
    pub fn stream_options(&self) -> pixelflash_block_stream::StreamOptions {
        pixelflash_block_stream::StreamOptions {
            block_size: self.block_size,
            pad_final_block: self.pad_final_block,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }
}
