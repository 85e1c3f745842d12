//! Storage service interface
//!
//! A storage service is one backend in the cluster's pool, addressed by its
//! service root. Clients place replicas by calling `put_block` on services
//! in probe order.

use crate::error::Result;
use crate::locator::Locator;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Network address of one storage backend, e.g. `http://keep0.example:25107`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceRoot(String);

impl ServiceRoot {
    pub fn new(root: impl Into<String>) -> Self {
        Self(root.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceRoot {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One storage backend as seen by a client
#[async_trait]
pub trait KeepService: Send + Sync {
    /// Address of this service
    fn root(&self) -> &ServiceRoot;

    /// Store a block, returning how many replicas the service now holds
    ///
    /// A service fronting replicated storage may report more than one.
    async fn put_block(
        &self,
        cancel: &CancellationToken,
        locator: &Locator,
        data: Bytes,
    ) -> Result<usize>;

    /// Fetch a block's full content
    async fn get_block(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes>;
}
