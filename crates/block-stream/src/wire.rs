//! OTA wire format.
//!
//! All integers are little-endian.
//!
//! ```text
//! SESSION HEADER (host -> device), 48 bytes:
//!   [4 bytes: command]      0x01 = flash
//!   [4 bytes: total_size]   logical payload length
//!   [32 bytes: digest]      SHA-256 of the logical payload
//!   [4 bytes: block_size]
//!   [4 bytes: block_count]
//! ACK (device -> host): [1 byte: 0x06]
//!
//! PER BLOCK (host -> device):
//!   [4 bytes: block_index]
//!   [4 bytes: block_length]
//!   [block_length bytes: data]
//! ACK (device -> host): [1 byte: 0x06]
//! ```
//!
//! Any byte other than `0x06` in place of an ACK is a rejection.

use std::borrow::Cow;
use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AckStage, BlockStreamError};

/// Session command: write the payload to flash.
pub const COMMAND_FLASH: u32 = 0x01;

/// Acknowledgement byte.
pub const ACK: u8 = 0x06;

/// Rejection byte sent by the loopback receiver.
pub const NAK: u8 = 0x15;

/// Byte used to pad the final block.
pub const PAD_BYTE: u8 = 0xFF;

pub const SESSION_HEADER_LEN: usize = 48;
pub const BLOCK_HEADER_LEN: usize = 8;

/// Digest field width in the session header.
pub const DIGEST_FIELD_LEN: usize = 32;

/// The frame that opens an OTA session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub command: u32,
    pub total_size: u32,
    pub digest: [u8; DIGEST_FIELD_LEN],
    pub block_size: u32,
    pub block_count: u32,
}

impl SessionHeader {
    pub fn encode(&self) -> [u8; SESSION_HEADER_LEN] {
        let mut buf = [0u8; SESSION_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.command.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        buf[8..40].copy_from_slice(&self.digest);
        buf[40..44].copy_from_slice(&self.block_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.block_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SESSION_HEADER_LEN]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut digest = [0u8; DIGEST_FIELD_LEN];
        digest.copy_from_slice(&buf[8..40]);
        Self {
            command: u32_at(0),
            total_size: u32_at(4),
            digest,
            block_size: u32_at(40),
            block_count: u32_at(44),
        }
    }
}

/// Per-block frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub index: u32,
    pub length: u32,
}

/// Number of blocks needed for `total` bytes, or `None` for a zero
/// `block_size` or a count the header's `u32` field cannot carry.
pub fn block_count(total: u64, block_size: usize) -> Option<u32> {
    if block_size == 0 {
        return None;
    }
    u32::try_from(total.div_ceil(block_size as u64)).ok()
}

/// Prepares a block for the wire.
///
/// A short block is padded with [`PAD_BYTE`] up to `block_size` when `pad`
/// is set; full blocks are borrowed as-is.
pub fn frame_block(data: &[u8], block_size: usize, pad: bool) -> Cow<'_, [u8]> {
    if !pad || data.len() >= block_size {
        return Cow::Borrowed(data);
    }
    let mut framed = Vec::with_capacity(block_size);
    framed.extend_from_slice(data);
    framed.resize(block_size, PAD_BYTE);
    Cow::Owned(framed)
}

pub async fn write_session_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &SessionHeader,
) -> Result<(), BlockStreamError> {
    writer.write_all(&header.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_session_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<SessionHeader, BlockStreamError> {
    let mut buf = [0u8; SESSION_HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(SessionHeader::decode(&buf))
}

/// Writes one block frame (header + data) and flushes.
pub async fn write_block<W: AsyncWrite + Unpin>(
    writer: &mut W,
    index: u32,
    data: &[u8],
) -> Result<(), BlockStreamError> {
    let length = u32::try_from(data.len())
        .map_err(|_| BlockStreamError::Protocol(format!("block too large: {}", data.len())))?;
    writer.write_u32_le(index).await?;
    writer.write_u32_le(length).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a block header.
///
/// Returns `None` if the peer closed the connection cleanly first.
pub async fn read_block_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<BlockHeader>, BlockStreamError> {
    let index = match reader.read_u32_le().await {
        Ok(i) => i,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let length = reader.read_u32_le().await?;
    Ok(Some(BlockHeader { index, length }))
}

/// Writes a single acknowledgement (or rejection) byte.
pub async fn write_ack<W: AsyncWrite + Unpin>(
    writer: &mut W,
    byte: u8,
) -> Result<(), BlockStreamError> {
    writer.write_u8(byte).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads an acknowledgement byte for `stage`.
pub async fn read_ack<R: AsyncRead + Unpin>(
    reader: &mut R,
    stage: AckStage,
) -> Result<(), BlockStreamError> {
    match reader.read_u8().await {
        Ok(ACK) => Ok(()),
        Ok(byte) => Err(BlockStreamError::Nak { stage, byte }),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(BlockStreamError::Closed(stage)),
        Err(e) => Err(e.into()),
    }
}
