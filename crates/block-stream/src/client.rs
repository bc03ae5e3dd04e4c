//! OTA block sender (host side).
//!
//! Connects to the device's OTA port, announces the session with a header,
//! then streams fixed-size blocks in strict lock-step: one frame out, one
//! ACK back.

use std::time::Duration;

use pixelflash_transfer::Digest;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AckStage, BlockStreamError};
use crate::wire::{
    COMMAND_FLASH, SessionHeader, block_count, frame_block, read_ack, write_block,
    write_session_header,
};
use crate::{ACK_TIMEOUT, CONNECT_TIMEOUT, DEFAULT_BLOCK_SIZE};

/// Sender tuning.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub block_size: usize,
    /// Pad the final block with `0xFF` up to `block_size`.
    pub pad_final_block: bool,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            pad_final_block: true,
            connect_timeout: CONNECT_TIMEOUT,
            ack_timeout: ACK_TIMEOUT,
        }
    }
}

/// Result of a completed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub blocks: u32,
    /// Logical payload bytes acknowledged (padding excluded).
    pub bytes: u64,
}

/// OTA block sender.
pub struct BlockStreamClient;

impl BlockStreamClient {
    /// Streams `data` to the device at `addr` in one session.
    ///
    /// Cancellation is honoured while connecting and between blocks, never
    /// while a block is in flight. `progress` receives the number of
    /// logical bytes acknowledged so far. The connection is closed on
    /// every exit path.
    pub async fn send(
        addr: &str,
        data: &[u8],
        digest: &Digest,
        options: &StreamOptions,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<u64>>,
    ) -> Result<StreamReport, BlockStreamError> {
        if options.block_size == 0 {
            return Err(BlockStreamError::Protocol("block size must be > 0".into()));
        }
        let total_size = u32::try_from(data.len()).map_err(|_| {
            BlockStreamError::Protocol(format!("payload too large: {} bytes", data.len()))
        })?;
        let blocks = block_count(data.len() as u64, options.block_size).ok_or_else(|| {
            BlockStreamError::Protocol(format!(
                "{} bytes do not fit in blocks of {}",
                data.len(),
                options.block_size
            ))
        })?;
        let block_size = u32::try_from(options.block_size).map_err(|_| {
            BlockStreamError::Protocol(format!("block size too large: {}", options.block_size))
        })?;

        let header = SessionHeader {
            command: COMMAND_FLASH,
            total_size,
            digest: *digest.as_bytes(),
            block_size,
            block_count: blocks,
        };

        // Connect with timeout + cancellation.
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BlockStreamError::Cancelled);
            }
            result = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)) => {
                match result {
                    Ok(Ok(s)) => {
                        info!(%addr, "OTA connection established");
                        s
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(BlockStreamError::ConnectTimeout),
                }
            }
        };
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.split();

        write_session_header(&mut writer, &header).await?;
        Self::await_ack(&mut reader, AckStage::Header, options.ack_timeout).await?;
        debug!(
            total_size,
            blocks,
            block_size = options.block_size,
            "OTA header acknowledged"
        );

        let mut sent: u64 = 0;
        for (index, block) in data.chunks(options.block_size).enumerate() {
            if cancel.is_cancelled() {
                info!(block = index, "OTA stream cancelled");
                return Err(BlockStreamError::Cancelled);
            }

            let index = index as u32;
            let framed = frame_block(block, options.block_size, options.pad_final_block);
            write_block(&mut writer, index, &framed).await?;
            Self::await_ack(&mut reader, AckStage::Block(index), options.ack_timeout).await?;

            sent += block.len() as u64;
            if let Some(tx) = progress {
                // Report progress (non-blocking).
                let _ = tx.try_send(sent);
            }
        }

        let _ = writer.shutdown().await;
        info!(blocks, bytes = sent, "OTA stream complete");
        Ok(StreamReport {
            blocks,
            bytes: sent,
        })
    }

    async fn await_ack<R: tokio::io::AsyncRead + Unpin>(
        reader: &mut R,
        stage: AckStage,
        timeout: Duration,
    ) -> Result<(), BlockStreamError> {
        match tokio::time::timeout(timeout, read_ack(reader, stage)).await {
            Ok(result) => result,
            Err(_) => Err(BlockStreamError::AckTimeout(stage)),
        }
    }
}
