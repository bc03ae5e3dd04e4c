use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::types::TransferPhase;

/// Point-in-time copy of the transfer status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub session_id: Option<String>,
    pub phase: TransferPhase,
    /// Strategy label once one has been selected.
    pub strategy: Option<String>,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub last_error: Option<String>,
    pub bytes_per_second: f64,
}

impl StatusSnapshot {
    /// Completion percentage (0.0 - 100.0).
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 / self.total_bytes as f64 * 100.0
    }

    /// Estimated time until `bytes_sent` reaches `total_bytes`.
    pub fn eta(&self) -> Option<Duration> {
        if self.bytes_per_second <= 0.0 || self.phase != TransferPhase::Transferring {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_sent);
        Some(Duration::from_secs_f64(
            remaining as f64 / self.bytes_per_second,
        ))
    }
}

/// Single status record shared by the active session and any number of
/// observers.
///
/// Writes go through a `watch` channel, so readers always see a whole
/// snapshot and can either poll [`snapshot`](Self::snapshot) or await
/// changes on a [`subscribe`](Self::subscribe) receiver.
pub struct StatusReporter {
    tx: watch::Sender<StatusSnapshot>,
    speed: SpeedCalculator,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self {
            tx,
            speed: SpeedCalculator::new(None, None),
        }
    }

    /// Starts a fresh record for a new session. The phase goes back to Idle.
    pub fn reset(&self, session_id: &str, total_bytes: u64) {
        self.speed.reset();
        self.tx.send_replace(StatusSnapshot {
            session_id: Some(session_id.to_string()),
            total_bytes,
            ..StatusSnapshot::default()
        });
    }

    pub fn set_phase(&self, phase: TransferPhase) {
        self.tx.send_if_modified(|s| {
            if s.phase == phase {
                return false;
            }
            s.phase = phase;
            if phase.is_terminal() {
                s.bytes_per_second = 0.0;
            }
            true
        });
    }

    pub fn set_strategy(&self, label: &str) {
        self.tx.send_modify(|s| s.strategy = Some(label.to_string()));
    }

    /// Moves the byte counter forward. Values below the current count are
    /// ignored so observers never see progress go backwards.
    pub fn advance_to(&self, bytes_sent: u64) {
        let current = self.tx.borrow().bytes_sent;
        if bytes_sent <= current {
            return;
        }
        self.speed.add_sample(bytes_sent - current);
        let rate = self.speed.bytes_per_second();
        self.tx.send_modify(|s| {
            s.bytes_sent = bytes_sent;
            s.bytes_per_second = rate;
        });
    }

    /// Publishes the terminal phase of `session_id`, with its error if any.
    ///
    /// Does nothing and returns `false` when the reporter has already been
    /// reset for another session.
    pub fn finish(&self, session_id: &str, phase: TransferPhase, error: Option<&str>) -> bool {
        self.tx.send_if_modified(|s| {
            if s.session_id.as_deref() != Some(session_id) {
                return false;
            }
            s.phase = phase;
            if let Some(message) = error {
                s.last_error = Some(message.to_string());
            }
            s.bytes_per_second = 0.0;
            true
        })
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes predate it.
        let total: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        s.samples.clear();
    }
}
