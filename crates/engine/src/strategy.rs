//! Transport strategies: how bytes reach the device.
//!
//! One enum variant per transport. Selection happens once per session and
//! never changes mid-transfer.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use pixelflash_block_stream::{BlockStreamClient, BlockStreamError, StreamOptions};
use pixelflash_transfer::{
    Chunk, ChunkReader, Digest, Payload, StatusReporter, chunk_count,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::device::DeviceLink;
use crate::error::{DeviceError, EngineError};
use crate::types::{
    ChunkRequest, Destination, DestinationKind, PayloadLayout, StrategyKind, UploadRequest,
};

/// Picks the transport for a payload of `len` bytes.
pub fn select_strategy(
    len: u64,
    destination: &Destination,
    config: &EngineConfig,
) -> Result<StrategyKind, EngineError> {
    match destination.kind {
        DestinationKind::RawOta => Ok(StrategyKind::BlockStreamOta),
        DestinationKind::Http if len <= config.small_file_threshold => {
            Ok(StrategyKind::DirectUpload)
        }
        DestinationKind::Http if destination.supports_chunked() => Ok(StrategyKind::ChunkedUpload),
        DestinationKind::Http => Err(EngineError::Validation(format!(
            "{len} bytes exceeds the single-request limit of {} bytes and {destination} has no chunked upload endpoints",
            config.small_file_threshold
        ))),
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Errors a retry loop can classify.
pub trait RetryableError: Display {
    fn is_retryable(&self) -> bool;

    fn is_cancellation(&self) -> bool {
        false
    }
}

impl RetryableError for DeviceError {
    fn is_retryable(&self) -> bool {
        !matches!(self, DeviceError::MissingEndpoint(_))
    }
}

impl RetryableError for BlockStreamError {
    fn is_retryable(&self) -> bool {
        BlockStreamError::is_retryable(self)
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, BlockStreamError::Cancelled)
    }
}

/// Fixed-budget, fixed-backoff retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }

    /// Runs `op` until it succeeds or the budget is spent.
    ///
    /// Cancellation is checked before every attempt and interrupts the
    /// backoff sleep, never an attempt in flight.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, EngineError>
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = String::new();
        let mut attempt = 0;
        while attempt < self.attempts {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_cancellation() => return Err(EngineError::Cancelled),
                Err(e) => {
                    warn!(what, attempt, attempts = self.attempts, error = %e, "attempt failed");
                    last_error = e.to_string();
                    if !e.is_retryable() {
                        break;
                    }
                }
            }

            if attempt < self.attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        Err(EngineError::Transport(format!(
            "{what} failed after {attempt} attempt(s): {last_error}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Device-side file name of chunk `index`.
pub fn chunk_file_name(index: u32) -> String {
    format!("chunk_{index:03}.bin")
}

/// Metadata sent with a single-shot upload.
pub fn direct_metadata(len: u64, layout: &PayloadLayout, digest: &Digest) -> serde_json::Value {
    json!({
        "total_size": len,
        "total_records": layout.record_count,
        "unit_delay_ms": layout.unit_delay_ms,
        "digest": digest.to_hex(),
    })
}

/// Position of one acknowledged chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
}

impl From<&Chunk> for ChunkSpan {
    fn from(chunk: &Chunk) -> Self {
        Self {
            index: chunk.index,
            offset: chunk.offset,
            size: chunk.len() as u64,
        }
    }
}

/// Metadata posted once after the last chunk.
pub fn chunked_metadata(
    len: u64,
    chunk_size: usize,
    layout: &PayloadLayout,
    digest: &Digest,
    spans: &[ChunkSpan],
) -> serde_json::Value {
    let chunks: Vec<serde_json::Value> = spans
        .iter()
        .map(|span| {
            let mut entry = json!({
                "index": span.index,
                "file": chunk_file_name(span.index),
                "offset": span.offset,
                "size": span.size,
            });
            if let Some((start, count)) = layout.records_in(span.offset, span.size) {
                entry["record_start"] = json!(start);
                entry["record_count"] = json!(count);
            }
            entry
        })
        .collect();

    json!({
        "chunked": true,
        "total_size": len,
        "chunk_count": spans.len(),
        "max_chunk_size": chunk_size,
        "total_records": layout.record_count,
        "unit_delay_ms": layout.unit_delay_ms,
        "digest": digest.to_hex(),
        "chunks": chunks,
    })
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Everything a strategy needs for one send.
pub struct StrategyContext<'a> {
    pub session_id: &'a str,
    pub payload: &'a Payload,
    pub digest: &'a Digest,
    pub destination: &'a Destination,
    pub layout: &'a PayloadLayout,
    pub device: &'a dyn DeviceLink,
    pub status: &'a StatusReporter,
    pub cancel: &'a CancellationToken,
    pub retry: RetryPolicy,
}

/// Wire-level result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOutcome {
    pub detail: String,
    /// Requests or blocks acknowledged.
    pub units: u32,
}

#[derive(Debug, Clone)]
pub enum TransportStrategy {
    DirectUpload,
    ChunkedUpload { chunk_size: usize },
    BlockStreamOta(StreamOptions),
}

impl TransportStrategy {
    pub fn for_kind(kind: StrategyKind, config: &EngineConfig) -> Self {
        match kind {
            StrategyKind::DirectUpload => TransportStrategy::DirectUpload,
            StrategyKind::ChunkedUpload => TransportStrategy::ChunkedUpload {
                chunk_size: config.chunk_size,
            },
            StrategyKind::BlockStreamOta => {
                TransportStrategy::BlockStreamOta(config.stream_options())
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            TransportStrategy::DirectUpload => StrategyKind::DirectUpload,
            TransportStrategy::ChunkedUpload { .. } => StrategyKind::ChunkedUpload,
            TransportStrategy::BlockStreamOta(_) => StrategyKind::BlockStreamOta,
        }
    }

    /// Moves the payload to the device, reporting progress into
    /// `ctx.status`.
    pub async fn send(&self, ctx: &StrategyContext<'_>) -> Result<TransportOutcome, EngineError> {
        match self {
            TransportStrategy::DirectUpload => send_direct(ctx).await,
            TransportStrategy::ChunkedUpload { chunk_size } => send_chunked(ctx, *chunk_size).await,
            TransportStrategy::BlockStreamOta(options) => send_block_stream(ctx, options).await,
        }
    }
}

async fn read_payload(payload: &Payload) -> Result<Vec<u8>, EngineError> {
    let payload = payload.clone();
    tokio::task::spawn_blocking(move || payload.read_all())
        .await
        .map_err(|e| EngineError::Transport(format!("task join error: {e}")))?
        .map_err(EngineError::from)
}

async fn send_direct(ctx: &StrategyContext<'_>) -> Result<TransportOutcome, EngineError> {
    let data = read_payload(ctx.payload).await?;
    let len = data.len() as u64;
    let request = UploadRequest {
        file_name: ctx.payload.name().to_string(),
        data,
        metadata: direct_metadata(len, ctx.layout, ctx.digest),
    };

    ctx.retry
        .run("upload", ctx.cancel, || ctx.device.upload(request.clone()))
        .await?;
    ctx.status.advance_to(len);

    debug!(session = %ctx.session_id, bytes = len, "single-shot upload acknowledged");
    Ok(TransportOutcome {
        detail: format!("uploaded {len} bytes in one request"),
        units: 1,
    })
}

async fn send_chunked(
    ctx: &StrategyContext<'_>,
    chunk_size: usize,
) -> Result<TransportOutcome, EngineError> {
    let len = ctx.payload.len();
    let total = chunk_count(len, chunk_size)?;

    let payload = ctx.payload.clone();
    let mut reader = tokio::task::spawn_blocking(move || ChunkReader::new(&payload, chunk_size))
        .await
        .map_err(|e| EngineError::Transport(format!("task join error: {e}")))??;

    let mut spans = Vec::with_capacity(total as usize);
    let mut sent: u64 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            info!(session = %ctx.session_id, chunks_sent = spans.len(), "chunked upload cancelled");
            return Err(EngineError::Cancelled);
        }

        let (r, next) = tokio::task::spawn_blocking(move || {
            let chunk = reader.next_chunk();
            (reader, chunk)
        })
        .await
        .map_err(|e| EngineError::Transport(format!("task join error: {e}")))?;
        reader = r;

        let Some(chunk) = next? else {
            break;
        };

        let span = ChunkSpan::from(&chunk);
        let request = ChunkRequest {
            index: chunk.index,
            total,
            file_name: chunk_file_name(chunk.index),
            data: chunk.data,
        };

        let what = format!("chunk {}/{}", span.index + 1, total);
        ctx.retry
            .run(&what, ctx.cancel, || ctx.device.upload_chunk(request.clone()))
            .await?;

        sent += span.size;
        spans.push(span);
        ctx.status.advance_to(sent);
        debug!(
            session = %ctx.session_id,
            chunk = span.index,
            bytes = span.size,
            sent,
            "chunk acknowledged"
        );
    }

    let metadata = chunked_metadata(len, chunk_size, ctx.layout, ctx.digest, &spans);
    ctx.retry
        .run("metadata", ctx.cancel, || {
            ctx.device.post_metadata(metadata.clone())
        })
        .await?;

    info!(session = %ctx.session_id, chunks = spans.len(), bytes = sent, "chunked upload complete");
    Ok(TransportOutcome {
        detail: format!("uploaded {sent} bytes in {} chunks", spans.len()),
        units: spans.len() as u32,
    })
}

async fn send_block_stream(
    ctx: &StrategyContext<'_>,
    options: &StreamOptions,
) -> Result<TransportOutcome, EngineError> {
    let data = read_payload(ctx.payload).await?;
    let addr = ctx.destination.socket_addr();
    let (progress_tx, mut progress_rx) = mpsc::channel::<u64>(64);

    // No block-level resume: every retry reopens the connection and
    // restarts from the session header.
    let stream = async move {
        ctx.retry
            .run("OTA stream", ctx.cancel, || {
                BlockStreamClient::send(
                    &addr,
                    &data,
                    ctx.digest,
                    options,
                    ctx.cancel,
                    Some(&progress_tx),
                )
            })
            .await
    };
    let forward = async {
        while let Some(bytes) = progress_rx.recv().await {
            ctx.status.advance_to(bytes);
        }
    };

    let (report, ()) = tokio::join!(stream, forward);
    let report = report?;
    ctx.status.advance_to(report.bytes);

    info!(
        session = %ctx.session_id,
        blocks = report.blocks,
        bytes = report.bytes,
        "OTA stream complete"
    );
    Ok(TransportOutcome {
        detail: format!("streamed {} bytes in {} blocks", report.bytes, report.blocks),
        units: report.blocks,
    })
}
