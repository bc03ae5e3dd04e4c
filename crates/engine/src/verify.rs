//! Post-transfer integrity check against the device's own digest.

use std::time::Duration;

use pixelflash_transfer::Digest;
use tracing::{info, warn};

use crate::device::DeviceLink;
use crate::types::{VerificationResult, VerificationTier};

/// Asks the device for the digest of what it stored and grades the answer.
///
/// Only a well-formed digest that differs from the local one is a failure.
/// Anything the device cannot answer degrades to [`VerificationTier::LocalOnly`].
#[derive(Debug, Clone, Copy)]
pub struct VerificationCoordinator {
    timeout: Duration,
}

impl VerificationCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn verify(&self, local: &Digest, device: &dyn DeviceLink) -> VerificationResult {
        let report = match tokio::time::timeout(self.timeout, device.query_hash()).await {
            Err(_) => {
                warn!(timeout = ?self.timeout, "hash query timed out");
                return VerificationResult::local_only(*local, "hash query timed out");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "hash query failed");
                return VerificationResult::local_only(*local, format!("hash query failed: {e}"));
            }
            Ok(Ok(None)) => {
                return VerificationResult::local_only(*local, "device has no hash endpoint");
            }
            Ok(Ok(Some(report))) => report,
        };

        if !report.status.eq_ignore_ascii_case("success") {
            return VerificationResult::local_only(
                *local,
                format!("device reported status {:?}", report.status),
            );
        }

        let remote = report.hash.trim();
        if remote.is_empty() {
            return VerificationResult::local_only(*local, "device reported an empty hash");
        }
        if let Err(e) = Digest::from_hex(remote) {
            return VerificationResult::local_only(*local, format!("unusable device hash: {e}"));
        }

        let tier = if local.matches_hex(remote) {
            info!(digest = %local, "device digest matches");
            VerificationTier::Verified
        } else {
            warn!(local = %local, remote, "device digest differs");
            VerificationTier::Failed
        };

        VerificationResult {
            tier,
            local_digest: *local,
            remote_digest: Some(report.hash.clone()),
            remote_file: report.file,
            remote_size: report.size,
            reason: None,
        }
    }
}
