//! Cluster client
//!
//! All client state lives in an explicit [`ClientContext`]; callers that
//! need different service lists or replica defaults build separate
//! contexts.

use crate::gateway::{BlockWriteOptions, BlockWriteResponse, KeepGateway};
use crate::placer::ReplicaPlacer;
use async_trait::async_trait;
use bytes::Bytes;
use keepio_common::{ClientConfig, Error, KeepService, Locator, Result};
use keepio_placement::{ServiceRoots, probe_order};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Services and write defaults shared by every call
#[derive(Clone)]
pub struct ClientContext {
    /// Sorted by root, one entry per root
    services: Vec<Arc<dyn KeepService>>,
    roots: ServiceRoots,
    want_replicas: usize,
}

impl ClientContext {
    pub fn new(mut services: Vec<Arc<dyn KeepService>>, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        services.sort_by(|a, b| a.root().cmp(b.root()));
        services.dedup_by(|a, b| a.root() == b.root());
        let roots = ServiceRoots::new(services.iter().map(|s| s.root().clone()));
        Ok(Self {
            services,
            roots,
            want_replicas: config.want_replicas,
        })
    }

    #[must_use]
    pub const fn roots(&self) -> &ServiceRoots {
        &self.roots
    }

    #[must_use]
    pub const fn want_replicas(&self) -> usize {
        self.want_replicas
    }

    /// Services in `locator`'s probe order
    #[must_use]
    pub fn probe_services(&self, locator: &Locator) -> Vec<Arc<dyn KeepService>> {
        probe_order(locator.hash(), self.services.len())
            .into_iter()
            .map(|i| Arc::clone(&self.services[i]))
            .collect()
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("roots", &self.roots)
            .field("want_replicas", &self.want_replicas)
            .finish()
    }
}

/// Gateway that talks to storage services directly
#[derive(Clone, Debug)]
pub struct KeepClient {
    ctx: ClientContext,
}

impl KeepClient {
    pub const fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub const fn context(&self) -> &ClientContext {
        &self.ctx
    }
}

#[async_trait]
impl KeepGateway for KeepClient {
    async fn block_read(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes> {
        let mut last_err = None;
        for service in self.ctx.probe_services(locator) {
            let res = service
                .get_block(cancel, locator)
                .await
                .and_then(|data| locator.verify(&data).map(|()| data));
            match res {
                Ok(data) => return Ok(data),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_not_found() => {
                    debug!("{locator}: not on {}", service.root());
                }
                Err(e) => {
                    warn!("{locator}: read from {} failed: {e}", service.root());
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::not_found(locator.to_string())))
    }

    async fn block_write(
        &self,
        cancel: &CancellationToken,
        opts: BlockWriteOptions,
    ) -> Result<BlockWriteResponse> {
        let wanted = opts.replicas.unwrap_or(self.ctx.want_replicas);
        if wanted == 0 {
            return Err(Error::Configuration(
                "a write must want at least one replica".to_string(),
            ));
        }
        let (data, _) = opts.content.into_bytes_with_hash().await?;
        let locator = Locator::compute(&data);
        let replicas = ReplicaPlacer::new(self.ctx.probe_services(&locator), wanted)
            .write(cancel, &locator, data)
            .await?;
        Ok(BlockWriteResponse { locator, replicas })
    }
}
