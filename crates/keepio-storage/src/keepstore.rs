//! Keepstore: one storage service over a set of volumes

use crate::volume::{TrashSweepStats, Volume};
use async_trait::async_trait;
use bytes::Bytes;
use keepio_common::{Error, KeepService, Locator, Result, ServiceRoot, VolumeConfig};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Storage service fronting an ordered list of volumes
#[derive(Debug)]
pub struct Keepstore {
    root: ServiceRoot,
    volumes: Vec<Arc<Volume>>,
}

impl Keepstore {
    pub fn new(root: ServiceRoot, volumes: Vec<Arc<Volume>>) -> Self {
        Self { root, volumes }
    }

    /// Open directory-backed volumes for every config whose root is `root`
    pub async fn from_configs(root: ServiceRoot, configs: &[VolumeConfig]) -> Result<Self> {
        let mut volumes = Vec::new();
        for config in configs.iter().filter(|c| c.root == root) {
            volumes.push(Arc::new(Volume::open_dir(config).await?));
        }
        if volumes.is_empty() {
            return Err(Error::Configuration(format!("no volumes configured for {root}")));
        }
        Ok(Self::new(root, volumes))
    }

    #[must_use]
    pub fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    #[must_use]
    pub fn volume(&self, name: &str) -> Option<&Arc<Volume>> {
        self.volumes.iter().find(|v| v.name() == name)
    }

    /// Sweep trash on every writable volume
    ///
    /// A failing volume is logged and skipped.
    pub async fn empty_trash_all(&self, cancel: &CancellationToken) -> Result<TrashSweepStats> {
        let mut total = TrashSweepStats::default();
        for volume in self.volumes.iter().filter(|v| v.writable()) {
            match volume.empty_trash(cancel).await {
                Ok(stats) => total += stats,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("EmptyTrash failed on {}: {e}", volume.name()),
            }
        }
        Ok(total)
    }

    /// Index of every volume, concatenated
    pub async fn index_to<W>(&self, cancel: &CancellationToken, prefix: &str, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        for volume in &self.volumes {
            volume.index_to(cancel, prefix, writer).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeepService for Keepstore {
    fn root(&self) -> &ServiceRoot {
        &self.root
    }

    async fn put_block(
        &self,
        cancel: &CancellationToken,
        locator: &Locator,
        data: Bytes,
    ) -> Result<usize> {
        locator.verify(&data)?;

        // Already stored somewhere: refresh it instead of writing again.
        for volume in self.volumes.iter().filter(|v| v.writable()) {
            match volume.compare(cancel, locator, &data).await {
                Ok(true) => {
                    volume.touch(cancel, locator).await?;
                    return Ok(volume.replication());
                }
                Ok(false) => warn!("{}: stored copy of {locator} differs", volume.name()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_not_found() => {}
                Err(e) => debug!("{}: compare {locator}: {e}", volume.name()),
            }
        }

        let mut last_err = None;
        for volume in self.volumes.iter().filter(|v| v.writable()) {
            match volume.put(cancel, locator, data.clone()).await {
                Ok(()) => return Ok(volume.replication()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{}: put {locator}: {e}", volume.name());
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(Error::transient(format!(
                "{}: all volumes failed, last error: {e}",
                self.root
            ))),
            None => Err(Error::permanent(format!("{}: no writable volumes", self.root))),
        }
    }

    async fn get_block(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes> {
        let mut last_err = Error::not_found(locator.to_string());
        for volume in &self.volumes {
            match volume.get(cancel, locator).await {
                Ok(data) => match locator.verify(&data) {
                    Ok(()) => return Ok(data),
                    Err(e) => {
                        warn!("{}: corrupt copy of {locator}: {e}", volume.name());
                        last_err = e;
                    }
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_not_found() => {}
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}
