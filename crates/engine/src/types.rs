//! Data types for the transfer flow.

use std::fmt;

use chrono::{DateTime, Utc};
use pixelflash_transfer::{Digest, TransferError, TransferPhase, validate_endpoint_path};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Default HTTP port on the device.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// How the destination accepts payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// HTTP endpoints (single-shot or chunked uploads).
    #[default]
    Http,
    /// Raw OTA block protocol over TCP.
    RawOta,
}

/// Device paths, relative to the HTTP base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub probe: String,
    pub upload: String,
    pub chunked_upload: Option<String>,
    pub metadata: Option<String>,
    pub hash_query: Option<String>,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            probe: "/status".into(),
            upload: "/upload".into(),
            chunked_upload: Some("/upload-chunked".into()),
            metadata: Some("/upload-metadata".into()),
            hash_query: Some("/firmware-hash".into()),
        }
    }
}

impl EndpointPaths {
    pub fn validate(&self) -> Result<(), TransferError> {
        validate_endpoint_path(&self.probe)?;
        validate_endpoint_path(&self.upload)?;
        for path in [&self.chunked_upload, &self.metadata, &self.hash_query]
            .into_iter()
            .flatten()
        {
            validate_endpoint_path(path)?;
        }
        Ok(())
    }
}

/// Where a payload goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub kind: DestinationKind,
    pub paths: EndpointPaths,
    /// HTTP port used for hash queries on a raw OTA destination.
    pub query_port: Option<u16>,
}

impl Destination {
    /// An HTTP destination on port 80 with the default paths.
    pub fn http(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_HTTP_PORT,
            kind: DestinationKind::Http,
            paths: EndpointPaths::default(),
            query_port: None,
        }
    }

    /// A raw OTA destination on the well-known OTA port.
    pub fn raw_ota(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: pixelflash_block_stream::OTA_PORT,
            kind: DestinationKind::RawOta,
            paths: EndpointPaths::default(),
            query_port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_query_port(mut self, port: u16) -> Self {
        self.query_port = Some(port);
        self
    }

    pub fn with_paths(mut self, paths: EndpointPaths) -> Self {
        self.paths = paths;
        self
    }

    /// `host:port` of the transfer endpoint.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for HTTP endpoints, if the destination has any.
    pub fn http_base(&self) -> Option<String> {
        let port = match self.kind {
            DestinationKind::Http => self.port,
            DestinationKind::RawOta => self.query_port?,
        };
        Some(format!("http://{}:{port}", self.host))
    }

    pub fn url(&self, path: &str) -> Option<String> {
        self.http_base().map(|base| format!("{base}{path}"))
    }

    /// Whether chunked uploads are possible (chunk and metadata endpoints).
    pub fn supports_chunked(&self) -> bool {
        self.kind == DestinationKind::Http
            && self.paths.chunked_upload.is_some()
            && self.paths.metadata.is_some()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr())
    }
}

/// Caller's declaration of logical record (frame) boundaries.
///
/// The engine never parses payloads; the device needs these numbers to
/// play back pattern data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLayout {
    pub record_count: u32,
    /// Fixed record size in bytes, when known.
    pub record_size: Option<u32>,
    pub unit_delay_ms: u32,
}

impl Default for PayloadLayout {
    fn default() -> Self {
        Self {
            record_count: 1,
            record_size: None,
            unit_delay_ms: 100,
        }
    }
}

impl PayloadLayout {
    /// Records overlapping `[offset, offset + len)` as `(start, count)`.
    ///
    /// `None` when the record size is unknown.
    pub fn records_in(&self, offset: u64, len: u64) -> Option<(u32, u32)> {
        let size = u64::from(self.record_size.filter(|s| *s > 0)?);
        let start = (offset / size).min(u64::from(self.record_count));
        let end = (offset + len).div_ceil(size).min(u64::from(self.record_count));
        Some((start as u32, end.saturating_sub(start) as u32))
    }
}

/// Which transport moved the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DirectUpload,
    ChunkedUpload,
    BlockStreamOta,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::DirectUpload => "direct_upload",
            StrategyKind::ChunkedUpload => "chunked_upload",
            StrategyKind::BlockStreamOta => "block_stream_ota",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-shot upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub data: Vec<u8>,
    pub metadata: serde_json::Value,
}

/// One numbered chunk of a chunked upload.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub index: u32,
    pub total: u32,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Device answer to a hash query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: String,
}

/// Strength of the evidence that the device stored the payload intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    /// Device digest matches the local digest.
    Verified,
    /// Device acknowledged receipt; no digest comparison was possible.
    LocalOnly,
    /// Device digest differs from the local digest.
    Failed,
}

impl VerificationTier {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationTier::Verified => "verified",
            VerificationTier::LocalOnly => "local_only",
            VerificationTier::Failed => "failed",
        }
    }
}

impl fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub tier: VerificationTier,
    pub local_digest: Digest,
    /// Hex digest exactly as the device reported it.
    pub remote_digest: Option<String>,
    pub remote_file: Option<String>,
    pub remote_size: Option<u64>,
    pub reason: Option<String>,
}

impl VerificationResult {
    pub(crate) fn local_only(local: Digest, reason: impl Into<String>) -> Self {
        Self {
            tier: VerificationTier::LocalOnly,
            local_digest: local,
            remote_digest: None,
            remote_file: None,
            remote_size: None,
            reason: Some(reason.into()),
        }
    }
}

/// Why a session did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Final outcome of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub session_id: String,
    pub state: TransferPhase,
    pub strategy: Option<StrategyKind>,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub local_digest: Option<Digest>,
    pub verification: Option<VerificationResult>,
    pub failure: Option<Failure>,
}

impl TransferResult {
    /// Bytes reached the device (verified or not).
    pub fn is_success(&self) -> bool {
        matches!(
            self.state,
            TransferPhase::Verified | TransferPhase::CompletedUnverified
        )
    }

    pub fn tier(&self) -> Option<VerificationTier> {
        self.verification.as_ref().map(|v| v.tier)
    }
}

/// One finished session, kept for the upload report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub payload_name: String,
    pub size: u64,
    pub destination: String,
    pub local_digest: Option<Digest>,
    pub strategy: Option<StrategyKind>,
    pub state: TransferPhase,
    pub tier: Option<VerificationTier>,
    pub failure: Option<Failure>,
    pub finished_at: DateTime<Utc>,
}

/// Serialisable summary of the upload history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub verified: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub entries: Vec<HistoryEntry>,
}

impl UploadReport {
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Self {
        let succeeded = entries
            .iter()
            .filter(|e| {
                matches!(
                    e.state,
                    TransferPhase::Verified | TransferPhase::CompletedUnverified
                )
            })
            .count();
        let verified = entries
            .iter()
            .filter(|e| e.tier == Some(VerificationTier::Verified))
            .count();
        let total_bytes = entries.iter().map(|e| e.size).sum();
        Self {
            generated_at: Utc::now(),
            total: entries.len(),
            succeeded,
            verified,
            failed: entries.len() - succeeded,
            total_bytes,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_destination_defaults() {
        let d = Destination::http("192.168.4.1");
        assert_eq!(d.port, 80);
        assert_eq!(d.http_base().as_deref(), Some("http://192.168.4.1:80"));
        assert_eq!(
            d.url("/firmware-hash").as_deref(),
            Some("http://192.168.4.1:80/firmware-hash")
        );
        assert!(d.supports_chunked());
        assert!(d.paths.validate().is_ok());
    }

    #[test]
    fn raw_ota_http_base_needs_query_port() {
        let d = Destination::raw_ota("10.0.0.7");
        assert_eq!(d.port, 8266);
        assert_eq!(d.socket_addr(), "10.0.0.7:8266");
        assert!(d.http_base().is_none());
        assert!(!d.supports_chunked());

        let d = d.with_query_port(8080);
        assert_eq!(d.http_base().as_deref(), Some("http://10.0.0.7:8080"));
    }

    #[test]
    fn chunked_needs_both_endpoints() {
        let paths = EndpointPaths {
            metadata: None,
            ..EndpointPaths::default()
        };
        assert!(!Destination::http("h").with_paths(paths).supports_chunked());
    }

    #[test]
    fn invalid_paths_rejected() {
        let paths = EndpointPaths {
            upload: "upload".into(),
            ..EndpointPaths::default()
        };
        assert!(paths.validate().is_err());
    }

    #[test]
    fn records_in_ranges() {
        let layout = PayloadLayout {
            record_count: 10,
            record_size: Some(100),
            unit_delay_ms: 50,
        };
        assert_eq!(layout.records_in(0, 250), Some((0, 3)));
        assert_eq!(layout.records_in(250, 250), Some((2, 3)));
        assert_eq!(layout.records_in(900, 100), Some((9, 1)));
        assert_eq!(PayloadLayout::default().records_in(0, 10), None);
    }

    #[test]
    fn hash_report_tolerates_missing_fields() {
        let report: HashReport = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        assert_eq!(report.status, "error");
        assert!(report.hash.is_empty());
        assert!(report.size.is_none());
    }

    #[test]
    fn layout_partial_deserialize() {
        let layout: PayloadLayout = serde_json::from_str(r#"{"record_count":5}"#).unwrap();
        assert_eq!(layout.record_count, 5);
        assert_eq!(layout.unit_delay_ms, 100);
    }
}
