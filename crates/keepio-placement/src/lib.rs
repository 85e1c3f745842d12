//! KeepIO Placement - deterministic replica placement
//!
//! Every client derives the same ordering of storage services for a given
//! block from the block's content hash and the canonical service list. The
//! ordering is a public contract: independent implementations given the same
//! inputs produce the same sequence, so no registry of block locations is
//! needed.
//!
//! # Example
//! ```ignore
//! use keepio_placement::ServiceRoots;
//!
//! let roots = ServiceRoots::new(discovered_roots);
//! let order = roots.probe_sequence(&locator);
//! ```

pub mod probe;

pub use probe::{ServiceRoots, probe_order};
