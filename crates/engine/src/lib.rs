//! Transfer and verification engine for constrained devices.
//!
//! Moves one payload at a time to an ESP-01 class device and proves it
//! arrived intact. The engine owns a single upload slot, mirroring the
//! device's own capacity: [`Engine::begin`] fails fast while a session is
//! active instead of queueing.
//!
//! # Pipeline
//!
//! 1. **Validate** the payload and pick a transport
//! 2. **Probe** the device
//! 3. **Digest** the payload locally (SHA-256)
//! 4. **Send** through a [`TransportStrategy`], with per-unit retries
//! 5. **Verify** against the device's own digest, if asked to

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod session;
pub mod strategy;
pub mod types;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use device::{DeviceConnector, DeviceFuture, DeviceLink, HttpConnector, HttpDevice};
pub use engine::{Engine, SessionHandle};
pub use error::{DeviceError, EngineError, ErrorKind};
pub use session::TransferSession;
pub use strategy::{RetryPolicy, TransportOutcome, TransportStrategy, select_strategy};
pub use types::{
    Destination, DestinationKind, EndpointPaths, Failure, HashReport, HistoryEntry,
    PayloadLayout, StrategyKind, TransferResult, UploadReport, VerificationResult,
    VerificationTier,
};
pub use verify::VerificationCoordinator;

pub use pixelflash_transfer::{Digest, Payload, StatusSnapshot, TransferPhase};
