//! One transfer, from validation to a terminal phase.

use std::sync::Arc;

use pixelflash_transfer::{
    Digest, Payload, StatusReporter, TransferPhase, digest_payload, validate_payload,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::device::{DeviceConnector, DeviceLink};
use crate::error::EngineError;
use crate::strategy::{RetryPolicy, StrategyContext, TransportStrategy, select_strategy};
use crate::types::{
    Destination, Failure, PayloadLayout, StrategyKind, TransferResult, VerificationResult,
    VerificationTier,
};
use crate::verify::VerificationCoordinator;

/// Runs a blocking closure off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, pixelflash_transfer::TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Transport(format!("task join error: {e}")))?
        .map_err(EngineError::from)
}

/// What a session learned before it stopped, kept for the result.
#[derive(Default)]
struct Findings {
    strategy: Option<StrategyKind>,
    local_digest: Option<Digest>,
    verification: Option<VerificationResult>,
}

/// A single transfer of one payload to one destination.
///
/// The owning [`Engine`](crate::Engine) holds the upload slot and resets
/// the status reporter before the session runs.
pub struct TransferSession {
    pub(crate) id: String,
    pub(crate) payload: Payload,
    pub(crate) destination: Destination,
    pub(crate) layout: PayloadLayout,
    pub(crate) verify: bool,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) connector: Arc<dyn DeviceConnector>,
    pub(crate) status: Arc<StatusReporter>,
    pub(crate) cancel: CancellationToken,
}

impl TransferSession {
    /// Drives the session to a terminal phase. Never fails; errors are
    /// folded into the result.
    pub async fn run(self) -> TransferResult {
        self.run_with(|_| {}).await
    }

    /// Like [`run`](Self::run), but calls `settle` with the finished result
    /// before the terminal phase is published to observers.
    pub async fn run_with<F>(self, settle: F) -> TransferResult
    where
        F: FnOnce(&TransferResult),
    {
        let mut findings = Findings::default();
        let outcome = self.execute(&mut findings).await;

        let (state, failure) = match outcome {
            Ok(state) => (state, None),
            Err(EngineError::Cancelled) => {
                info!(session = %self.id, "transfer cancelled");
                (
                    TransferPhase::Cancelled,
                    Some(Failure {
                        kind: EngineError::Cancelled.kind(),
                        message: EngineError::Cancelled.to_string(),
                    }),
                )
            }
            Err(e) => {
                error!(session = %self.id, kind = %e.kind(), error = %e, "transfer failed");
                (
                    TransferPhase::Failed,
                    Some(Failure {
                        kind: e.kind(),
                        message: e.to_string(),
                    }),
                )
            }
        };

        let snapshot = self.status.snapshot();
        let result = TransferResult {
            session_id: self.id,
            state,
            strategy: findings.strategy,
            bytes_sent: snapshot.bytes_sent,
            total_bytes: self.payload.len(),
            local_digest: findings.local_digest,
            verification: findings.verification,
            failure,
        };

        settle(&result);

        let error = result.failure.as_ref().map(|f| f.message.as_str());
        if !self.status.finish(&result.session_id, state, error) {
            debug!(session = %result.session_id, "status already taken over by a newer session");
        }
        result
    }

    fn check_cancel(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn execute(&self, findings: &mut Findings) -> Result<TransferPhase, EngineError> {
        self.status.set_phase(TransferPhase::Preparing);
        info!(
            session = %self.id,
            payload = %self.payload.name(),
            bytes = self.payload.len(),
            destination = %self.destination,
            "transfer starting"
        );

        // Validate.
        let payload = self.payload.clone();
        let max = self.config.max_payload_size;
        blocking(move || validate_payload(&payload, max)).await?;
        self.destination.paths.validate()?;

        let kind = select_strategy(self.payload.len(), &self.destination, &self.config)?;
        findings.strategy = Some(kind);
        self.status.set_strategy(kind.as_str());
        self.check_cancel()?;

        // Preflight.
        let device = self
            .connector
            .connect(&self.destination, &self.config)
            .map_err(|e| EngineError::Unreachable(format!("{}: {e}", self.destination)))?;
        self.probe(device.as_ref()).await?;
        self.check_cancel()?;

        // Digest.
        let payload = self.payload.clone();
        let block_size = self.config.digest_block_size;
        let digest = blocking(move || digest_payload(&payload, block_size)).await?;
        findings.local_digest = Some(digest);
        debug!(session = %self.id, digest = %digest, "local digest computed");
        self.check_cancel()?;

        // Transfer.
        self.status.set_phase(TransferPhase::Transferring);
        let strategy = TransportStrategy::for_kind(kind, &self.config);
        let ctx = StrategyContext {
            session_id: &self.id,
            payload: &self.payload,
            digest: &digest,
            destination: &self.destination,
            layout: &self.layout,
            device: device.as_ref(),
            status: &self.status,
            cancel: &self.cancel,
            retry: RetryPolicy::from_config(&self.config),
        };
        let outcome = strategy.send(&ctx).await?;
        info!(session = %self.id, strategy = %kind, detail = %outcome.detail, "payload delivered");

        if !self.verify {
            return Ok(TransferPhase::CompletedUnverified);
        }

        // Verify.
        self.status.set_phase(TransferPhase::AwaitingVerification);
        let verification = VerificationCoordinator::new(self.config.verify_timeout())
            .verify(&digest, device.as_ref())
            .await;
        let tier = verification.tier;
        let remote = verification.remote_digest.clone().unwrap_or_default();
        findings.verification = Some(verification);

        match tier {
            VerificationTier::Verified => Ok(TransferPhase::Verified),
            VerificationTier::LocalOnly => {
                warn!(session = %self.id, "device digest unavailable; delivery unverified");
                Ok(TransferPhase::CompletedUnverified)
            }
            VerificationTier::Failed => Err(EngineError::VerificationMismatch {
                local: digest.to_hex(),
                remote,
            }),
        }
    }

    async fn probe(&self, device: &dyn DeviceLink) -> Result<(), EngineError> {
        probe_device(
            device,
            &self.destination,
            self.config.probe_timeout(),
            &self.cancel,
        )
        .await?;
        debug!(session = %self.id, destination = %self.destination, "device reachable");
        Ok(())
    }
}

/// Preflight: the device must answer within `timeout`.
pub(crate) async fn probe_device(
    device: &dyn DeviceLink,
    destination: &Destination,
    timeout: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        r = tokio::time::timeout(timeout, device.probe()) => r,
    };
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EngineError::Unreachable(format!("{destination}: {e}"))),
        Err(_) => Err(EngineError::Unreachable(format!(
            "{destination}: no answer within {timeout:?}"
        ))),
    }
}
