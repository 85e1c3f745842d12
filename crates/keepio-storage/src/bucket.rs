//! Object bucket abstraction
//!
//! A volume keeps every block as a handful of flat objects in a bucket: the
//! data itself plus `recent/` and `trash/` marker objects. The only
//! coordination primitive is each object's last-modified time, stamped by
//! the bucket when the object is written.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use keepio_common::{Clock, Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Listing/HEAD entry for one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Flat key/value object store with server-side timestamps
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    /// Metadata for `key`, or `NotFound`
    async fn head(&self, key: &str) -> Result<ObjectInfo>;

    /// Full content of `key`, or `NotFound`
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Create or replace `key`, stamping it with the current time
    ///
    /// Readers never observe a partially written object.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Copy `src` over `dst`, stamping `dst` with the current time
    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        let data = self.get(src).await?;
        self.put(dst, data).await
    }

    /// All objects whose key starts with `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// In-memory bucket
///
/// Timestamps come from the supplied clock, so tests can lay down objects
/// "in the past" by pinning a `ManualClock` before writing.
pub struct MemoryBucket {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBucket {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of stored objects, markers included
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectBucket for MemoryBucket {
    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        self.objects
            .read()
            .get(key)
            .map(|obj| ObjectInfo {
                key: key.to_string(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            })
            .ok_or_else(|| Error::not_found(key))
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .map(|obj| obj.data.clone())
            .ok_or_else(|| Error::not_found(key))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let obj = StoredObject {
            data,
            last_modified: self.clock.now(),
        };
        self.objects.write().insert(key.to_string(), obj);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| ObjectInfo {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use keepio_common::ManualClock;

    #[tokio::test]
    async fn test_put_stamps_with_clock() {
        let clock = Arc::new(ManualClock::new());
        let bucket = MemoryBucket::new(clock.clone());
        let t = Utc::now() - TimeDelta::hours(3);
        clock.set(t);
        bucket.put("k", Bytes::from_static(b"v")).await.unwrap();

        let info = bucket.head("k").await.unwrap();
        assert_eq!(info.last_modified, t);
        assert_eq!(info.size, 1);
    }

    #[tokio::test]
    async fn test_copy_restamps_destination() {
        let clock = Arc::new(ManualClock::new());
        let bucket = MemoryBucket::new(clock.clone());
        let t0 = Utc::now();
        clock.set(t0 - TimeDelta::hours(1));
        bucket.put("src", Bytes::from_static(b"abc")).await.unwrap();
        clock.set(t0);
        bucket.copy("dst", "src").await.unwrap();

        assert_eq!(bucket.get("dst").await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(bucket.head("dst").await.unwrap().last_modified, t0);
        assert!(bucket.copy("x", "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_prefix_sorted() {
        let bucket = MemoryBucket::new(Arc::new(ManualClock::new()));
        for key in ["trash/b", "recent/a", "b", "a", "recent/b"] {
            bucket.put(key, Bytes::new()).await.unwrap();
        }
        let keys: Vec<String> = bucket
            .list("recent/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["recent/a", "recent/b"]);
        assert_eq!(bucket.list("").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let bucket = MemoryBucket::new(Arc::new(ManualClock::new()));
        assert!(bucket.delete("nope").await.is_ok());
        assert!(bucket.head("nope").await.unwrap_err().is_not_found());
    }
}
