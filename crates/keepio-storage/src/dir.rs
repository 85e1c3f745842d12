//! Directory-backed object bucket
//!
//! Keys map to paths below the root (`recent/X` lives in `<root>/recent/X`).
//! Writes land in a hidden temporary file beside the target and are renamed
//! into place. Timestamps are the files' modification times.
//!
//! A write runs on the blocking pool and owns its temporary file. When the
//! caller stops waiting, the writer notices between chunks, removes the file
//! and gives up.

use crate::bucket::{ObjectBucket, ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use keepio_common::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::info;

/// Prefix of in-progress writes; never listed
const TEMP_PREFIX: &str = ".tmp.";

/// Temporary files older than this at open are leftovers of a crash
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Bytes written between two checks for an abandoned write
const WRITE_CHUNK: usize = 1024 * 1024;

/// Raises the flag when the waiting caller goes away
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn write_then_rename(tmp: &Path, path: &Path, data: &[u8], abandoned: &AtomicBool) -> Result<()> {
    let mut file = std::fs::File::create(tmp)?;
    for chunk in data.chunks(WRITE_CHUNK) {
        if abandoned.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        file.write_all(chunk)?;
    }
    file.sync_all()?;
    drop(file);
    if abandoned.load(Ordering::Acquire) {
        return Err(Error::Cancelled);
    }
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Bucket stored as plain files under a directory
#[derive(Clone, Debug)]
pub struct DirectoryBucket {
    root: PathBuf,
}

impl DirectoryBucket {
    /// Open (creating if needed) a bucket rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let bucket = Self { root };
        let removed = bucket.remove_stale_temp_files(STALE_TEMP_AGE).await?;
        if removed > 0 {
            info!(
                "{}: removed {removed} stale temporary files",
                bucket.root.display()
            );
        }
        Ok(bucket)
    }

    /// Delete temporary files last modified more than `older_than` ago
    pub async fn remove_stale_temp_files(&self, older_than: Duration) -> Result<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let stale = meta.modified().is_ok_and(|t| t < cutoff);
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX)
                    && stale
                    && tokio::fs::remove_file(entry.path()).await.is_ok()
                {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(Error::internal(format!("invalid object key {key:?}")));
        }
        Ok(self.root.join(key))
    }

    fn info(key: String, meta: &std::fs::Metadata) -> Result<ObjectInfo> {
        let last_modified: DateTime<Utc> = meta.modified()?.into();
        Ok(ObjectInfo {
            key,
            size: meta.len(),
            last_modified,
        })
    }
}

#[async_trait]
impl ObjectBucket for DirectoryBucket {
    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let meta = tokio::fs::metadata(self.path(key)?)
            .await
            .map_err(|e| Error::from_io(e, key))?;
        if !meta.is_file() {
            return Err(Error::not_found(key));
        }
        Self::info(key.to_string(), &meta)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let data = tokio::fs::read(self.path(key)?)
            .await
            .map_err(|e| Error::from_io(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::internal(format!("no parent directory for {key}")))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));
        tokio::task::spawn_blocking(move || {
            let res = write_then_rename(&tmp, &path, &data, &abandoned);
            if res.is_err() {
                let _ = std::fs::remove_file(&tmp);
            }
            res
        })
        .await
        .map_err(|e| Error::internal(format!("write task: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        // Start from the deepest directory the prefix fully names.
        let (start_rel, _) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let start = if start_rel.is_empty() {
            self.root.clone()
        } else {
            self.path(start_rel)?
        };

        let mut found = Vec::new();
        let mut pending = vec![(start, start_rel.to_string())];
        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    // Removed between readdir and stat.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if meta.is_dir() {
                    if prefix.starts_with(&format!("{key}/")) || key.starts_with(prefix) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    found.push(Self::info(key, &meta)?);
                }
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }
}
