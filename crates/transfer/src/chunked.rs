use std::io::Read;

use sha2::{Digest as _, Sha256};

use crate::types::{Chunk, Digest, Payload, PayloadReader};
use crate::{DIGEST_BLOCK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Digest helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest::from_bytes(Sha256::digest(data).into())
}

/// Streams `reader` through SHA-256 in `block_size` reads.
///
/// Returns the digest and the number of bytes consumed. If `block_size`
/// is 0, [`DIGEST_BLOCK_SIZE`] is used.
pub fn digest_reader<R: Read>(
    mut reader: R,
    block_size: usize,
) -> Result<(Digest, u64), TransferError> {
    let block_size = if block_size == 0 {
        DIGEST_BLOCK_SIZE
    } else {
        block_size
    };
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size];
    let mut total: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Digest::from_bytes(hasher.finalize().into()), total))
}

/// Computes the digest of a whole payload.
///
/// Fails with [`TransferError::LengthMismatch`] if the source yields a
/// different number of bytes than the payload declares.
pub fn digest_payload(payload: &Payload, block_size: usize) -> Result<Digest, TransferError> {
    let reader = payload.open()?;
    let (digest, read) = digest_reader(reader, block_size)?;
    if read != payload.len() {
        return Err(TransferError::LengthMismatch {
            declared: payload.len(),
            actual: read,
        });
    }
    Ok(digest)
}

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// Number of chunks needed for `len` bytes: `ceil(len / chunk_size)`.
///
/// Fails for a zero `chunk_size` or a count that does not fit the `u32`
/// chunk index.
pub fn chunk_count(len: u64, chunk_size: usize) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize(chunk_size));
    }
    u32::try_from(len.div_ceil(chunk_size as u64))
        .map_err(|_| TransferError::TooManyChunks { len, chunk_size })
}

/// Lists `(index, offset, length)` for every chunk of a `len`-byte payload.
pub fn chunk_spans(len: u64, chunk_size: usize) -> Result<Vec<(u32, u64, usize)>, TransferError> {
    let spans = (0..chunk_count(len, chunk_size)?)
        .map(|index| {
            let offset = index as u64 * chunk_size as u64;
            let size = (len - offset).min(chunk_size as u64) as usize;
            (index, offset, size)
        })
        .collect();
    Ok(spans)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a payload in fixed-size, sequentially numbered chunks.
pub struct ChunkReader {
    reader: PayloadReader,
    chunk_size: usize,
    total: u32,
    next_index: u32,
    offset: u64,
    len: u64,
}

impl ChunkReader {
    /// Opens `payload` for chunked reading.
    pub fn new(payload: &Payload, chunk_size: usize) -> Result<Self, TransferError> {
        let total = chunk_count(payload.len(), chunk_size)?;
        Ok(Self {
            reader: payload.open()?,
            chunk_size,
            total,
            next_index: 0,
            offset: 0,
            len: payload.len(),
        })
    }

    /// Reads the next chunk. Returns `None` once the declared length is consumed.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.len - self.offset;
        if remaining == 0 {
            return Ok(None);
        }

        let want = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if filled < want {
            return Err(TransferError::LengthMismatch {
                declared: self.len,
                actual: self.offset + filled as u64,
            });
        }

        let chunk = Chunk {
            index: self.next_index,
            offset: self.offset,
            data: buf,
        };
        self.next_index += 1;
        self.offset += want as u64;
        Ok(Some(chunk))
    }

    /// Total number of chunks this reader will yield.
    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.len - self.offset
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
