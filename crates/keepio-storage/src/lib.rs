//! KeepIO Storage - volumes and the block lifecycle
//!
//! This crate provides:
//! - Object bucket abstraction with in-memory and directory-backed buckets
//! - Per-volume block lifecycle (put, trash, untrash, empty trash) driven
//!   entirely by object timestamps
//! - Keepstore, a storage service over a set of volumes

pub mod bucket;
pub mod dir;
pub mod keepstore;
pub mod stats;
pub mod volume;

pub use bucket::{MemoryBucket, ObjectBucket, ObjectInfo};
pub use dir::DirectoryBucket;
pub use keepstore::Keepstore;
pub use stats::{VolumeStats, VolumeStatsSnapshot};
pub use volume::{TrashSweepStats, Volume};
