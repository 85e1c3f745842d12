//! Configuration types for KeepIO
//!
//! This module defines configuration structures used across components.
//! Durations are stored as whole seconds so the file format stays plain TOML.

use crate::error::{Error, Result};
use crate::service::ServiceRoot;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for KeepIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-side write settings
    pub client: ClientConfig,
    /// Local block cache
    pub cache: CacheConfig,
    /// Storage volumes, grouped into services by `root`
    pub volumes: Vec<VolumeConfig>,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.cache.validate()?;
        for volume in &self.volumes {
            volume.validate()?;
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Replicas a write must reach to be reported successful
    pub want_replicas: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { want_replicas: 2 }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.want_replicas == 0 {
            return Err(Error::Configuration(
                "want_replicas must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Disk cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached blocks
    pub dir: PathBuf,
    /// Size budget enforced by tidy
    pub max_size_bytes: u64,
    /// Minimum time between two directory scans
    pub tidy_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/cache/keepio"),
            max_size_bytes: 1024 * 1024 * 1024, // 1 GB
            tidy_interval_secs: 30,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn tidy_interval(&self) -> Duration {
        Duration::from_secs(self.tidy_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Err(Error::Configuration(
                "cache max_size_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage volume configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Volume name (unique within a service)
    pub name: String,
    /// Service root this volume is exposed under
    pub root: ServiceRoot,
    /// Directory backing the volume's object bucket
    pub dir: PathBuf,
    /// Refuse writes, trash and untrash
    pub read_only: bool,
    /// Replicas the backing storage provides for each stored block
    pub replication: usize,
    /// Minimum age of a block's recent marker before Trash acts on it
    pub trash_margin_secs: u64,
    /// Age a trash marker must reach before EmptyTrash deletes it
    ///
    /// Zero disables trash retention: Trash either deletes immediately (when
    /// `unsafe_delete` is set) or refuses. Immediate deletion gives up the
    /// rescue that EmptyTrash performs for blocks trashed in a write race.
    pub trash_lifetime_secs: u64,
    /// Upper bound on how long a backend write can take to become visible
    pub race_window_secs: u64,
    /// Permit immediate deletion when trash retention is disabled
    pub unsafe_delete: bool,
    /// Concurrent workers used by EmptyTrash
    pub delete_concurrency: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            root: ServiceRoot::new("http://localhost:25107"),
            dir: PathBuf::from("/var/lib/keepio/volume"),
            read_only: false,
            replication: 1,
            trash_margin_secs: 14 * 24 * 3600, // 2 weeks
            trash_lifetime_secs: 14 * 24 * 3600,
            race_window_secs: 24 * 3600,
            unsafe_delete: false,
            delete_concurrency: 4,
        }
    }
}

impl VolumeConfig {
    #[must_use]
    pub const fn trash_margin(&self) -> Duration {
        Duration::from_secs(self.trash_margin_secs)
    }

    #[must_use]
    pub const fn trash_lifetime(&self) -> Duration {
        Duration::from_secs(self.trash_lifetime_secs)
    }

    #[must_use]
    pub const fn race_window(&self) -> Duration {
        Duration::from_secs(self.race_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication == 0 {
            return Err(Error::Configuration(format!(
                "volume {}: replication must be at least 1",
                self.name
            )));
        }
        if self.delete_concurrency == 0 {
            return Err(Error::Configuration(format!(
                "volume {}: delete_concurrency must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}
