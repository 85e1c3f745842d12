//! Per-volume operation counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket operation counters for one volume
#[derive(Debug, Default)]
pub struct VolumeStats {
    /// Every bucket call, whatever its kind
    pub ops: AtomicU64,
    pub get_ops: AtomicU64,
    pub head_ops: AtomicU64,
    pub put_ops: AtomicU64,
    pub del_ops: AtomicU64,
    pub list_ops: AtomicU64,
    /// Bytes read from the bucket
    pub in_bytes: AtomicU64,
    /// Bytes written to the bucket
    pub out_bytes: AtomicU64,
    /// Calls that failed for a reason other than NotFound
    pub errors: AtomicU64,
}

/// Point-in-time copy of [`VolumeStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VolumeStatsSnapshot {
    pub ops: u64,
    pub get_ops: u64,
    pub head_ops: u64,
    pub put_ops: u64,
    pub del_ops: u64,
    pub list_ops: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub errors: u64,
}

/// Which kind of bucket call is being counted
#[derive(Clone, Copy, Debug)]
pub(crate) enum Op {
    Get,
    Head,
    Put,
    Delete,
    List,
}

impl VolumeStats {
    pub(crate) fn tick(&self, op: Op) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let counter = match op {
            Op::Get => &self.get_ops,
            Op::Head => &self.head_ops,
            Op::Put => &self.put_ops,
            Op::Delete => &self.del_ops,
            Op::List => &self.list_ops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_in(&self, n: usize) {
        self.in_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_out(&self, n: usize) {
        self.out_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count `err` unless it is a plain miss
    pub(crate) fn record_error(&self, err: &keepio_common::Error) {
        if !err.is_not_found() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> VolumeStatsSnapshot {
        VolumeStatsSnapshot {
            ops: self.ops.load(Ordering::Relaxed),
            get_ops: self.get_ops.load(Ordering::Relaxed),
            head_ops: self.head_ops.load(Ordering::Relaxed),
            put_ops: self.put_ops.load(Ordering::Relaxed),
            del_ops: self.del_ops.load(Ordering::Relaxed),
            list_ops: self.list_ops.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
