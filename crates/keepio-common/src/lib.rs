//! KeepIO Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and utilities
//! used across all KeepIO components.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod locator;
pub mod service;

pub use cancel::cancellable;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ClientConfig, Config, VolumeConfig};
pub use error::{Error, Result};
pub use locator::{HASH_LEN, Locator, is_block_hash};
pub use service::{KeepService, ServiceRoot};

pub use tokio_util::sync::CancellationToken;
