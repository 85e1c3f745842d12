//! Replica placement
//!
//! Writes one block to services in probe order, keeping at most as many
//! attempts in flight as there are replicas still missing. Attempts finish
//! in any order; a failed service is logged and replaced by the next one in
//! the sequence, never retried.

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use keepio_common::{Error, KeepService, Locator, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One block write across a probe-ordered pool of services
pub struct ReplicaPlacer {
    pool: VecDeque<Arc<dyn KeepService>>,
    wanted: usize,
}

impl ReplicaPlacer {
    /// `order` is the block's probe sequence
    pub fn new(order: Vec<Arc<dyn KeepService>>, wanted: usize) -> Self {
        Self {
            pool: order.into(),
            wanted,
        }
    }

    /// Write until `wanted` replicas are stored
    ///
    /// Returns the replicas achieved. When the pool runs out first the
    /// error is `InsufficientReplicas` carrying the achieved count; the
    /// block is still readable from the services that stored it.
    pub async fn write(
        mut self,
        cancel: &CancellationToken,
        locator: &Locator,
        data: Bytes,
    ) -> Result<usize> {
        let wanted = self.wanted;
        if wanted == 0 {
            return Err(Error::Configuration(
                "a write must want at least one replica".to_string(),
            ));
        }
        let mut achieved = 0;
        let mut in_flight = FuturesUnordered::new();

        loop {
            if achieved >= wanted {
                return Ok(achieved);
            }
            let deficit = wanted - achieved;
            while in_flight.len() < deficit
                && let Some(service) = self.pool.pop_front()
            {
                let data = data.clone();
                in_flight.push(async move {
                    let res = service.put_block(cancel, locator, data).await;
                    (service, res)
                });
            }
            if in_flight.is_empty() {
                return Err(Error::InsufficientReplicas { achieved, wanted });
            }

            let (service, res) = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                Some(done) = in_flight.next() => done,
            };
            match res {
                Ok(replicas) => {
                    debug!("{locator}: stored {replicas} replica(s) on {}", service.root());
                    achieved += replicas;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("{locator}: write to {} failed: {e}", service.root()),
            }
        }
    }
}
