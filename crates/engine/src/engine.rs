//! The engine: one upload slot, session spawning, status and history.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use pixelflash_transfer::{
    Payload, StatusReporter, StatusSnapshot, TransferPhase, digest_payload, validate_payload,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::device::{DeviceConnector, HttpConnector};
use crate::error::{EngineError, ErrorKind};
use crate::session::{TransferSession, blocking, probe_device};
use crate::types::{
    Destination, Failure, HistoryEntry, PayloadLayout, TransferResult, UploadReport,
    VerificationResult,
};
use crate::verify::VerificationCoordinator;

struct ActiveSession {
    id: String,
    cancel: CancellationToken,
}

struct Shared {
    slot: Mutex<Option<ActiveSession>>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl Shared {
    fn release(&self, id: &str) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|active| active.id == id) {
            *slot = None;
        }
    }

    fn push_history(&self, entry: HistoryEntry) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

/// Frees the upload slot when the session task ends, however it ends.
struct SlotGuard {
    shared: Arc<Shared>,
    id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release(&self.id);
    }
}

/// Handle to a running (or finished) session.
pub struct SessionHandle {
    id: String,
    total_bytes: u64,
    task: JoinHandle<TransferResult>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the session to reach a terminal phase.
    pub async fn wait(self) -> TransferResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(session = %self.id, error = %e, "session task aborted");
                TransferResult {
                    session_id: self.id,
                    state: TransferPhase::Failed,
                    strategy: None,
                    bytes_sent: 0,
                    total_bytes: self.total_bytes,
                    local_digest: None,
                    verification: None,
                    failure: Some(Failure {
                        kind: ErrorKind::Transport,
                        message: format!("session task ended abnormally: {e}"),
                    }),
                }
            }
        }
    }
}

/// Transfer engine. Cheap to clone; clones share the slot, status and
/// history.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    connector: Arc<dyn DeviceConnector>,
    status: Arc<StatusReporter>,
    shared: Arc<Shared>,
}

impl Engine {
    /// Creates an engine that talks HTTP through `reqwest`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let connector = HttpConnector::new()
            .map_err(|e| EngineError::Transport(format!("HTTP client setup failed: {e}")))?;
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(
        config: EngineConfig,
        connector: Arc<dyn DeviceConnector>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connector,
            status: Arc::new(StatusReporter::new()),
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                history: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a session in the background.
    ///
    /// Fails fast with [`EngineError::Concurrency`] while another session
    /// holds the slot; nothing is queued.
    pub fn begin(
        &self,
        payload: Payload,
        destination: Destination,
        verify: bool,
        layout: PayloadLayout,
    ) -> Result<SessionHandle, EngineError> {
        let (id, cancel, guard) = self.claim_slot()?;

        self.status.reset(&id, payload.len());
        info!(session = %id, payload = %payload.name(), destination = %destination, "session started");

        let total_bytes = payload.len();
        let payload_name = payload.name().to_string();
        let destination_label = destination.to_string();
        let session = TransferSession {
            id: id.clone(),
            payload,
            destination,
            layout,
            verify,
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            status: Arc::clone(&self.status),
            cancel,
        };
        let shared = Arc::clone(&self.shared);

        // History and slot settle before the terminal phase is published.
        let task = tokio::spawn(async move {
            session
                .run_with(move |result| {
                    shared.push_history(HistoryEntry {
                        session_id: result.session_id.clone(),
                        payload_name,
                        size: result.total_bytes,
                        destination: destination_label,
                        local_digest: result.local_digest,
                        strategy: result.strategy,
                        state: result.state,
                        tier: result.tier(),
                        failure: result.failure.clone(),
                        finished_at: Utc::now(),
                    });
                    drop(guard);
                })
                .await
        });

        Ok(SessionHandle {
            id,
            total_bytes,
            task,
        })
    }

    /// Takes the upload slot under a fresh session id.
    fn claim_slot(&self) -> Result<(String, CancellationToken, SlotGuard), EngineError> {
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = slot.as_ref() {
            return Err(EngineError::Concurrency(active.id.clone()));
        }
        *slot = Some(ActiveSession {
            id: id.clone(),
            cancel: cancel.clone(),
        });
        let guard = SlotGuard {
            shared: Arc::clone(&self.shared),
            id: id.clone(),
        };
        Ok((id, cancel, guard))
    }

    /// Checks what the device already stores against `payload`, without
    /// uploading anything.
    ///
    /// Holds the upload slot for the duration, so it fails with
    /// [`EngineError::Concurrency`] while a transfer runs and can be
    /// cancelled through [`cancel_session`](Self::cancel_session). A digest
    /// mismatch is reported through the returned tier, not as an error.
    pub async fn verify_existing(
        &self,
        payload: Payload,
        destination: Destination,
    ) -> Result<VerificationResult, EngineError> {
        let (id, cancel, _guard) = self.claim_slot()?;
        info!(session = %id, payload = %payload.name(), destination = %destination, "verifying stored payload");

        let max = self.config.max_payload_size;
        let block_size = self.config.digest_block_size;
        let digest = blocking(move || {
            validate_payload(&payload, max)?;
            digest_payload(&payload, block_size)
        })
        .await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let device = self
            .connector
            .connect(&destination, &self.config)
            .map_err(|e| EngineError::Unreachable(format!("{destination}: {e}")))?;
        probe_device(
            device.as_ref(),
            &destination,
            self.config.probe_timeout(),
            &cancel,
        )
        .await?;

        let coordinator = VerificationCoordinator::new(self.config.verify_timeout());
        let verification = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            v = coordinator.verify(&digest, device.as_ref()) => v,
        };
        info!(session = %id, tier = %verification.tier, "stored payload checked");
        Ok(verification)
    }

    /// Runs a session to completion.
    pub async fn transfer(
        &self,
        payload: Payload,
        destination: Destination,
        verify: bool,
        layout: PayloadLayout,
    ) -> Result<TransferResult, EngineError> {
        Ok(self.begin(payload, destination, verify, layout)?.wait().await)
    }

    /// Status of `handle`'s session, while it is still the latest one.
    pub fn status(&self, handle: &SessionHandle) -> Option<StatusSnapshot> {
        let snapshot = self.status.snapshot();
        (snapshot.session_id.as_deref() == Some(handle.id())).then_some(snapshot)
    }

    pub fn current_status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Requests cancellation. Returns `true` if the session was live.
    pub fn cancel(&self, handle: &SessionHandle) -> bool {
        self.cancel_session(handle.id())
    }

    pub fn cancel_session(&self, id: &str) -> bool {
        let slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(active) if active.id == id => {
                if !active.cancel.is_cancelled() {
                    info!(session = %id, "cancellation requested");
                    active.cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Id of the session holding the slot, if any.
    pub fn active_session(&self) -> Option<String> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.id.clone())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn report(&self) -> UploadReport {
        UploadReport::from_entries(self.history())
    }
}
