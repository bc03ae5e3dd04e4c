//! Lock-step OTA block protocol over raw TCP.
//!
//! The device side has no buffering: every frame written by the sender must
//! be acknowledged with a single byte before the next one goes out. A
//! missing or wrong acknowledgement aborts the whole session; there is no
//! block-level resume.
//!
//! # Wire format
//!
//! See the [`wire`] module for frame layouts.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::{BlockStreamClient, StreamOptions, StreamReport};
pub use error::{AckStage, BlockStreamError};
pub use server::{BlockStreamServer, ReceivedSession, ReceiverBehavior};
pub use wire::{BlockHeader, SessionHeader};

use std::time::Duration;

/// Well-known OTA port on the device.
pub const OTA_PORT: u16 = 8266;

/// Default block size (1 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Timeout for the TCP connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for each single-byte acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);
