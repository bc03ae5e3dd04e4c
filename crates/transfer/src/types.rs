use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{DIGEST_LEN, TransferError};

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a 64-character hex digest (either case).
    pub fn from_hex(s: &str) -> Result<Self, TransferError> {
        let raw = hex::decode(s.trim()).map_err(|e| TransferError::InvalidDigest(e.to_string()))?;
        let bytes: [u8; DIGEST_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            TransferError::InvalidDigest(format!("expected {DIGEST_LEN} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compares against a hex string reported by a device, ignoring case.
    ///
    /// An empty string never matches.
    pub fn matches_hex(&self, other: &str) -> bool {
        let other = other.trim();
        !other.is_empty() && self.to_hex().eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Digest({})", &hex[..16])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone)]
enum PayloadSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// A read-only byte source to be transferred, with its declared length.
#[derive(Debug, Clone)]
pub struct Payload {
    name: String,
    len: u64,
    source: PayloadSource,
}

impl Payload {
    /// Creates a payload backed by a file on disk.
    ///
    /// The declared length is the file size at the time of the call.
    pub fn from_file(path: &Path) -> Result<Self, TransferError> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload.bin".into());
        Ok(Self {
            name,
            len: metadata.len(),
            source: PayloadSource::File(path.to_path_buf()),
        })
    }

    /// Creates an in-memory payload.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            len: data.len() as u64,
            source: PayloadSource::Memory(data),
        }
    }

    /// File name sent to the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing path for file payloads.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            PayloadSource::File(p) => Some(p),
            PayloadSource::Memory(_) => None,
        }
    }

    /// Opens a fresh reader positioned at offset 0.
    pub fn open(&self) -> Result<PayloadReader, TransferError> {
        Ok(match &self.source {
            PayloadSource::File(p) => PayloadReader::File(File::open(p)?),
            PayloadSource::Memory(data) => PayloadReader::Memory(Cursor::new(Arc::clone(data))),
        })
    }

    /// Reads the whole payload, checking it against the declared length.
    ///
    /// Only used for payloads already known to fit a single request.
    pub fn read_all(&self) -> Result<Vec<u8>, TransferError> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.open()?.take(self.len + 1).read_to_end(&mut buf)?;
        if buf.len() as u64 != self.len {
            return Err(TransferError::LengthMismatch {
                declared: self.len,
                actual: buf.len() as u64,
            });
        }
        Ok(buf)
    }
}

/// Reader over a [`Payload`].
pub enum PayloadReader {
    File(File),
    Memory(Cursor<Arc<[u8]>>),
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PayloadReader::File(f) => f.read(buf),
            PayloadReader::Memory(c) => c.read(buf),
        }
    }
}

impl Seek for PayloadReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            PayloadReader::File(f) => f.seek(pos),
            PayloadReader::Memory(c) => c.seek(pos),
        }
    }
}

/// A bounded, ordered slice of a payload sent as one wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based sequence number.
    pub index: u32,
    /// Byte offset within the payload.
    pub offset: u64,
    /// Logical chunk bytes (never padded).
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lifecycle phase of a transfer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    #[default]
    Idle,
    Preparing,
    Transferring,
    AwaitingVerification,
    Verified,
    CompletedUnverified,
    Failed,
    Cancelled,
}

impl TransferPhase {
    /// Terminal phases release the upload slot.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::Verified
                | TransferPhase::CompletedUnverified
                | TransferPhase::Failed
                | TransferPhase::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferPhase::Idle => "idle",
            TransferPhase::Preparing => "preparing",
            TransferPhase::Transferring => "transferring",
            TransferPhase::AwaitingVerification => "awaiting_verification",
            TransferPhase::Verified => "verified",
            TransferPhase::CompletedUnverified => "completed_unverified",
            TransferPhase::Failed => "failed",
            TransferPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_hex_roundtrip_and_case() {
        let d = Digest::from_bytes([0xAB; DIGEST_LEN]);
        let hex = d.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Digest::from_hex(&hex.to_uppercase()).unwrap(), d);
        assert!(d.matches_hex(&hex.to_uppercase()));
        assert!(!d.matches_hex(""));
    }

    #[test]
    fn digest_rejects_wrong_length() {
        assert!(matches!(
            Digest::from_hex("abcd"),
            Err(TransferError::InvalidDigest(_))
        ));
        assert!(Digest::from_hex("zz").is_err());
    }

    #[test]
    fn digest_serializes_as_hex_string() {
        let d = Digest::from_bytes([1; DIGEST_LEN]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn file_payload_reads_declared_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pattern.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let payload = Payload::from_file(&path).unwrap();
        assert_eq!(payload.name(), "pattern.bin");
        assert_eq!(payload.len(), 10);
        assert_eq!(payload.path(), Some(path.as_path()));
        assert_eq!(payload.read_all().unwrap(), b"0123456789");
    }

    #[test]
    fn read_all_detects_growth_after_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grows.bin");
        std::fs::write(&path, b"abc").unwrap();
        let payload = Payload::from_file(&path).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"def").unwrap();

        assert!(matches!(
            payload.read_all(),
            Err(TransferError::LengthMismatch {
                declared: 3,
                actual: 4
            })
        ));
    }

    #[test]
    fn directory_is_not_a_payload() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Payload::from_file(dir.path()).is_err());
    }

    #[test]
    fn memory_payload_reader_seeks() {
        let payload = Payload::from_bytes("mem.bin", b"hello world".to_vec());
        let mut r = payload.open().unwrap();
        r.seek(SeekFrom::Start(6)).unwrap();
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "world");
    }

    #[test]
    fn terminal_phases() {
        assert!(!TransferPhase::Idle.is_terminal());
        assert!(!TransferPhase::Transferring.is_terminal());
        assert!(!TransferPhase::AwaitingVerification.is_terminal());
        assert!(TransferPhase::Verified.is_terminal());
        assert!(TransferPhase::CompletedUnverified.is_terminal());
        assert!(TransferPhase::Failed.is_terminal());
        assert!(TransferPhase::Cancelled.is_terminal());
    }
}
