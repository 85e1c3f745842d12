//! KeepIO Client - writing, reading and caching blocks
//!
//! This crate provides:
//! - [`ReplicaPlacer`]: writes one block to services in probe order until
//!   the wanted replica count is reached
//! - [`KeepClient`]: the [`KeepGateway`] that talks to storage services
//! - [`DiskCache`]: a size-bounded local cache stacked on any gateway

pub mod cache;
pub mod client;
pub mod gateway;
pub mod placer;

pub use cache::{CacheStats, DiskCache, TidyStats};
pub use client::{ClientContext, KeepClient};
pub use gateway::{BlockContent, BlockWriteOptions, BlockWriteResponse, KeepGateway, copy_range};
pub use placer::ReplicaPlacer;
