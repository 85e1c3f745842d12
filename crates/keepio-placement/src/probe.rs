//! Probe sequence
//!
//! Orders the storage services for one block using nothing but the block's
//! hash and the canonical service list, so a reader can recompute the order
//! a writer used without asking anyone where the block lives.
//!
//! The hash is consumed 8 hex digits at a time. Each group, read as a `u32`,
//! picks (modulo the remaining pool size) the next service to append and
//! remove from the pool. When the digit stream runs dry it is refilled with
//! the full hash, prefixed by the hash's last 4 digits while the sequence is
//! still shorter than `hash.len() / 4`.

use keepio_common::{Locator, ServiceRoot};
use serde::{Deserialize, Serialize};

/// Hex digits consumed per pick
const DIGITS_PER_PROBE: usize = 8;

/// Canonical (deduplicated, sorted) list of service roots
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRoots {
    roots: Vec<ServiceRoot>,
}

impl ServiceRoots {
    /// Canonicalize `roots`
    ///
    /// Ordering must not depend on discovery order, otherwise two clients
    /// holding the same set would disagree on placement.
    pub fn new(roots: impl IntoIterator<Item = ServiceRoot>) -> Self {
        let mut roots: Vec<ServiceRoot> = roots.into_iter().collect();
        roots.sort();
        roots.dedup();
        Self { roots }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[ServiceRoot] {
        &self.roots
    }

    /// Position of `root` in canonical order
    #[must_use]
    pub fn position(&self, root: &ServiceRoot) -> Option<usize> {
        self.roots.binary_search(root).ok()
    }

    /// Probe sequence for `locator` over this service list
    #[must_use]
    pub fn probe_sequence(&self, locator: &Locator) -> Vec<ServiceRoot> {
        probe_order(locator.hash(), self.roots.len())
            .into_iter()
            .map(|i| self.roots[i].clone())
            .collect()
    }
}

/// Probe order for `hash` over `n` canonically ordered services
///
/// Returns a permutation of `0..n`. Hashes shorter than one probe group
/// cannot seed the sequence; they get canonical order.
#[must_use]
pub fn probe_order(hash: &str, n: usize) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..n).collect();
    if hash.len() < DIGITS_PER_PROBE || !hash.is_ascii() {
        return pool;
    }

    let mut seed = hash.to_string();
    let mut sequence = Vec::with_capacity(n);

    while !pool.is_empty() {
        if seed.len() < DIGITS_PER_PROBE {
            if sequence.len() < hash.len() / 4 {
                seed = hash[hash.len() - 4..].to_string();
            }
            seed.push_str(hash);
        }

        // A group that fails to parse picks the first remaining service.
        let probe = u32::from_str_radix(&seed[..DIGITS_PER_PROBE], 16).unwrap_or(0);
        let pick = probe as usize % pool.len();
        sequence.push(pool.remove(pick));
        seed.drain(..DIGITS_PER_PROBE);
    }

    sequence
}
