//! Disk cache in front of a block gateway
//!
//! Blocks are stored as plain files at `<dir>/<first 3 hex digits>/<hash>`.
//! Every file appears by rename from a uniquely named temporary file, so a
//! reader either sees a complete block or no file at all. The cache never
//! trusts what it finds: a file of the wrong size, or any error while
//! reading it (eviction, truncation or deletion by another process), sends
//! the read to the backing gateway instead. Local failures are logged and
//! never returned to the caller.
//!
//! Concurrent misses on one block share a single fetch. The fetch runs as
//! its own task, so it completes and populates the cache even if the caller
//! that started it is cancelled.

use crate::gateway::{BlockContent, BlockWriteOptions, BlockWriteResponse, KeepGateway, copy_range};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use keepio_common::{CacheConfig, Error, Locator, Result, cancellable};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Marker in the name of in-progress files
const TEMP_MARKER: &str = ".tmp.";

type Fill = Shared<BoxFuture<'static, Result<Bytes>>>;

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads served from a local file
    pub hits: AtomicU64,
    /// Reads that went to the gateway
    pub misses: AtomicU64,
    /// Files removed by tidy
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Outcome of one tidy pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TidyStats {
    pub files_before: u64,
    pub bytes_before: u64,
    pub files_evicted: u64,
    pub bytes_evicted: u64,
    pub temp_files_removed: u64,
}

struct Inner<G> {
    gateway: G,
    dir: PathBuf,
    max_size: u64,
    tidy_interval: Duration,
    /// In-progress fetches by block hash
    fills: Mutex<HashMap<String, Fill>>,
    /// Last local access by block hash; file mtime is used when absent
    atimes: DashMap<String, SystemTime>,
    last_tidy: Mutex<Option<Instant>>,
    tidying: AtomicBool,
    stats: CacheStats,
}

/// Size-bounded local cache over any [`KeepGateway`]
pub struct DiskCache<G> {
    inner: Arc<Inner<G>>,
}

impl<G> Clone for DiskCache<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: KeepGateway + 'static> DiskCache<G> {
    pub async fn open(gateway: G, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                gateway,
                dir: config.dir.clone(),
                max_size: config.max_size_bytes,
                tidy_interval: config.tidy_interval(),
                fills: Mutex::new(HashMap::new()),
                atimes: DashMap::new(),
                last_tidy: Mutex::new(None),
                tidying: AtomicBool::new(false),
                stats: CacheStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.inner.gateway
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Run an eviction pass now, regardless of the rate limit
    pub async fn tidy(&self) -> Result<TidyStats> {
        *self.inner.last_tidy.lock() = Some(Instant::now());
        self.inner.tidy().await
    }

    /// Fetch through the shared per-block fill
    async fn fill(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes> {
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        let fill = {
            let mut fills = self.inner.fills.lock();
            fills
                .entry(locator.hash().to_string())
                .or_insert_with(|| Inner::spawn_fill(&self.inner, locator.clone()))
                .clone()
        };
        cancellable(cancel, fill).await
    }
}

impl<G: KeepGateway + 'static> Inner<G> {
    fn path(&self, hash: &str) -> PathBuf {
        self.dir.join(&hash[..3]).join(hash)
    }

    fn spawn_fill(this: &Arc<Self>, locator: Locator) -> Fill {
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            let res = inner.fetch_and_store(&locator).await;
            inner.fills.lock().remove(locator.hash());
            res
        });
        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(Error::internal(format!("cache fill task: {e}"))))
        }
        .boxed()
        .shared()
    }

    async fn fetch_and_store(self: &Arc<Self>, locator: &Locator) -> Result<Bytes> {
        // Not tied to any caller: other readers may be waiting on this fill.
        let cancel = CancellationToken::new();
        let data = self.gateway.block_read(&cancel, locator).await?;
        locator.verify(&data)?;
        self.store(locator.hash(), &data).await;
        Ok(data)
    }

    /// Write a block file; failures only cost a future cache hit
    async fn store(self: &Arc<Self>, hash: &str, data: &[u8]) {
        match self.write_file(hash, data).await {
            Ok(()) => {
                self.atimes.insert(hash.to_string(), SystemTime::now());
            }
            Err(e) => warn!("cache: storing {hash} failed: {e}"),
        }
        self.schedule_tidy();
    }

    async fn write_file(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = self.path(hash);
        let dir = path
            .parent()
            .ok_or_else(|| Error::internal(format!("no cache directory for {hash}")))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!("{hash}{TEMP_MARKER}{}", uuid::Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read `buf.len()` bytes (fewer at the end of the block) from the
    /// cached file
    async fn read_local(&self, locator: &Locator, buf: &mut [u8], offset: u64) -> Result<usize> {
        let hash = locator.hash();
        let mut file = tokio::fs::File::open(self.path(hash)).await?;
        let len = file.metadata().await?.len();
        if len != locator.size() {
            return Err(Error::CacheCorruption(format!(
                "{hash}: file is {len} bytes, want {}",
                locator.size()
            )));
        }
        if offset >= len {
            return Ok(0);
        }
        let want = usize::try_from(len - offset).map_or(buf.len(), |rest| rest.min(buf.len()));
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf[..want]).await?;
        self.atimes.insert(hash.to_string(), SystemTime::now());
        Ok(want)
    }

    async fn read_local_all(&self, locator: &Locator) -> Result<Bytes> {
        let hash = locator.hash();
        let data = tokio::fs::read(self.path(hash)).await?;
        if data.len() as u64 != locator.size() {
            return Err(Error::CacheCorruption(format!(
                "{hash}: file is {} bytes, want {}",
                data.len(),
                locator.size()
            )));
        }
        self.atimes.insert(hash.to_string(), SystemTime::now());
        Ok(Bytes::from(data))
    }

    /// Start a background tidy unless one ran within `tidy_interval` or is
    /// still running
    fn schedule_tidy(self: &Arc<Self>) {
        {
            let mut last = self.last_tidy.lock();
            if last.is_some_and(|t| t.elapsed() < self.tidy_interval) {
                return;
            }
            if self.tidying.swap(true, Ordering::AcqRel) {
                return;
            }
            *last = Some(Instant::now());
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.tidy().await {
                warn!("cache: tidy failed: {e}");
            }
            inner.tidying.store(false, Ordering::Release);
        });
    }

    async fn tidy(&self) -> Result<TidyStats> {
        struct Entry {
            path: PathBuf,
            hash: String,
            size: u64,
            atime: SystemTime,
        }

        let mut stats = TidyStats::default();
        let mut entries = Vec::new();
        let stale_before = SystemTime::now()
            .checked_sub(self.tidy_interval)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut dirs = tokio::fs::read_dir(&self.dir).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = match tokio::fs::read_dir(dir.path()).await {
                Ok(files) => files,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(file) = files.next_entry().await? {
                let Ok(meta) = file.metadata().await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let name = file.file_name().to_string_lossy().into_owned();
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if name.contains(TEMP_MARKER) {
                    // Left behind by a writer that died mid-write.
                    if mtime < stale_before && tokio::fs::remove_file(file.path()).await.is_ok() {
                        stats.temp_files_removed += 1;
                    }
                    continue;
                }
                let atime = self.atimes.get(&name).map_or(mtime, |t| *t);
                entries.push(Entry {
                    path: file.path(),
                    hash: name,
                    size: meta.len(),
                    atime,
                });
            }
        }

        stats.files_before = entries.len() as u64;
        stats.bytes_before = entries.iter().map(|e| e.size).sum();
        if stats.bytes_before <= self.max_size {
            return Ok(stats);
        }

        entries.sort_by_key(|e| e.atime);
        let mut total = stats.bytes_before;
        for entry in entries {
            if total <= self.max_size {
                break;
            }
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("cache: evicting {}: {e}", entry.path.display());
                    continue;
                }
            }
            self.atimes.remove(&entry.hash);
            total -= entry.size;
            stats.files_evicted += 1;
            stats.bytes_evicted += entry.size;
        }
        self.stats
            .evictions
            .fetch_add(stats.files_evicted, Ordering::Relaxed);
        info!(
            "cache: tidy evicted {} files ({} bytes), {} bytes remain",
            stats.files_evicted, stats.bytes_evicted, total
        );
        Ok(stats)
    }
}

#[async_trait]
impl<G: KeepGateway + 'static> KeepGateway for DiskCache<G> {
    async fn block_read(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes> {
        match self.inner.read_local_all(locator).await {
            Ok(data) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data);
            }
            Err(e) => debug!("cache: {locator}: {e}; fetching"),
        }
        self.fill(cancel, locator).await
    }

    async fn read_at(
        &self,
        cancel: &CancellationToken,
        locator: &Locator,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        match self.inner.read_local(locator, buf, offset).await {
            Ok(n) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(n);
            }
            Err(e) => debug!("cache: {locator}: {e}; fetching"),
        }
        let data = self.fill(cancel, locator).await?;
        Ok(copy_range(&data, buf, offset))
    }

    async fn block_write(
        &self,
        cancel: &CancellationToken,
        opts: BlockWriteOptions,
    ) -> Result<BlockWriteResponse> {
        let (data, hash) = opts.content.into_bytes_with_hash().await?;
        let resp = self
            .inner
            .gateway
            .block_write(
                cancel,
                BlockWriteOptions {
                    content: BlockContent::Data(data.clone()),
                    replicas: opts.replicas,
                },
            )
            .await?;
        if resp.locator.hash() == hash {
            self.inner.store(&hash, &data).await;
        } else {
            warn!(
                "cache: gateway returned {} for content hashing to {hash}; not caching",
                resp.locator
            );
        }
        Ok(resp)
    }

    fn local_locator(&self, locator: &Locator) -> Result<Locator> {
        self.inner.gateway.local_locator(locator)
    }
}
