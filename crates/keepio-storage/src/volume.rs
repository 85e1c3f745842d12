//! Volume block lifecycle
//!
//! Each block `X` is kept as up to three bucket objects:
//!
//! - `X`: the data
//! - `recent/X`: empty marker, rewritten on every Put and Touch
//! - `trash/X`: copy of the data, written when the block is trashed
//!
//! No locks are taken. Several keepstore processes (and the garbage
//! collector driving them) may act on the same block at once, and every
//! decision is made by comparing object timestamps against grace periods:
//!
//! - `trash_margin`: a block touched more recently than this cannot be
//!   trashed, and a trash marker written less than this after the last
//!   touch is evidence of a race between Trash and Put.
//! - `trash_lifetime`: how long a trash marker ages before EmptyTrash may
//!   delete it.
//! - `race_window`: slack for backends whose timestamps become visible
//!   late.
//!
//! Combined states (data and trash both present) are expected outcomes of
//! those races and every operation tolerates them.

use crate::bucket::{ObjectBucket, ObjectInfo};
use crate::dir::DirectoryBucket;
use crate::stats::{Op, VolumeStats};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use keepio_common::{
    Clock, Error, Locator, Result, SystemClock, VolumeConfig, cancellable, is_block_hash,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECENT: &str = "recent/";
const TRASH: &str = "trash/";

fn recent_key(key: &str) -> String {
    format!("{RECENT}{key}")
}

fn trash_key(key: &str) -> String {
    format!("{TRASH}{key}")
}

/// Outcome of one EmptyTrash sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrashSweepStats {
    pub blocks_in_trash: u64,
    pub bytes_in_trash: u64,
    pub blocks_deleted: u64,
    pub bytes_deleted: u64,
}

impl std::ops::AddAssign for TrashSweepStats {
    fn add_assign(&mut self, other: Self) {
        self.blocks_in_trash += other.blocks_in_trash;
        self.bytes_in_trash += other.bytes_in_trash;
        self.blocks_deleted += other.blocks_deleted;
        self.bytes_deleted += other.bytes_deleted;
    }
}

/// One storage volume on top of an object bucket
pub struct Volume {
    name: String,
    bucket: Arc<dyn ObjectBucket>,
    clock: Arc<dyn Clock>,
    read_only: bool,
    replication: usize,
    trash_margin: TimeDelta,
    trash_lifetime: TimeDelta,
    race_window: TimeDelta,
    unsafe_delete: bool,
    delete_concurrency: usize,
    stats: VolumeStats,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("replication", &self.replication)
            .finish_non_exhaustive()
    }
}

impl Volume {
    pub fn new(
        config: &VolumeConfig,
        bucket: Arc<dyn ObjectBucket>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let delta = |d: Duration, what: &str| {
            TimeDelta::from_std(d).map_err(|_| {
                Error::Configuration(format!("volume {}: {what} out of range", config.name))
            })
        };
        Ok(Self {
            name: config.name.clone(),
            bucket,
            clock,
            read_only: config.read_only,
            replication: config.replication,
            trash_margin: delta(config.trash_margin(), "trash_margin_secs")?,
            trash_lifetime: delta(config.trash_lifetime(), "trash_lifetime_secs")?,
            race_window: delta(config.race_window(), "race_window_secs")?,
            unsafe_delete: config.unsafe_delete,
            delete_concurrency: config.delete_concurrency,
            stats: VolumeStats::default(),
        })
    }

    /// Volume backed by `config.dir` on the local filesystem
    pub async fn open_dir(config: &VolumeConfig) -> Result<Self> {
        let bucket = DirectoryBucket::open(&config.dir).await?;
        Self::new(config, Arc::new(bucket), Arc::new(SystemClock))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replicas one stored copy on this volume counts for
    #[must_use]
    pub const fn replication(&self) -> usize {
        self.replication
    }

    #[must_use]
    pub const fn writable(&self) -> bool {
        !self.read_only
    }

    #[must_use]
    pub const fn stats(&self) -> &VolumeStats {
        &self.stats
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::MethodDisabled(self.name.clone()));
        }
        Ok(())
    }

    /// Store `data` and mark the block recently written
    pub async fn put(&self, cancel: &CancellationToken, locator: &Locator, data: Bytes) -> Result<()> {
        self.check_writable()?;
        let key = locator.hash();
        cancellable(cancel, async {
            self.bucket_put(key, data).await?;
            self.bucket_put(&recent_key(key), Bytes::new()).await
        })
        .await
    }

    /// Block content
    ///
    /// A block whose data was moved to trash by a Trash that raced with a
    /// Put or Touch is restored before reading.
    pub async fn get(&self, cancel: &CancellationToken, locator: &Locator) -> Result<Bytes> {
        cancellable(cancel, self.get_block(locator)).await
    }

    async fn get_block(&self, locator: &Locator) -> Result<Bytes> {
        let key = locator.hash();
        match self.bucket_get(key).await {
            Err(e) if e.is_not_found() => {}
            res => return res,
        }
        if self.head_opt(&recent_key(key)).await?.is_none() || !self.fix_race(key).await? {
            return Err(Error::not_found(locator.to_string()));
        }
        self.bucket_get(key).await
    }

    /// Whether the stored block equals `data`
    pub async fn compare(
        &self,
        cancel: &CancellationToken,
        locator: &Locator,
        data: &[u8],
    ) -> Result<bool> {
        let stored = cancellable(cancel, self.get_block(locator)).await?;
        Ok(stored.as_ref() == data)
    }

    /// Refresh the recent marker of a stored block
    pub async fn touch(&self, cancel: &CancellationToken, locator: &Locator) -> Result<()> {
        self.check_writable()?;
        cancellable(cancel, self.touch_block(locator.hash())).await
    }

    async fn touch_block(&self, key: &str) -> Result<()> {
        if self.head_opt(key).await?.is_none() && !self.fix_race(key).await? {
            return Err(Error::not_found(key));
        }
        self.bucket_put(&recent_key(key), Bytes::new()).await
    }

    /// Time the block was last written or touched
    pub async fn mtime(&self, cancel: &CancellationToken, locator: &Locator) -> Result<DateTime<Utc>> {
        cancellable(cancel, self.mtime_block(locator.hash())).await
    }

    async fn mtime_block(&self, key: &str) -> Result<DateTime<Utc>> {
        self.bucket_head(key).await?;
        if let Some(recent) = self.head_opt(&recent_key(key)).await? {
            return Ok(recent.last_modified);
        }
        // Stored without a marker; adopt it as written now.
        info!("{}: creating missing recent marker for {key}", self.name);
        self.bucket_put(&recent_key(key), Bytes::new()).await?;
        Ok(self.bucket_head(&recent_key(key)).await?.last_modified)
    }

    /// Move a block to trash
    ///
    /// A block touched within `trash_margin` is left alone and the call
    /// succeeds. With a zero `trash_lifetime` the data is deleted outright
    /// when `unsafe_delete` is set, and refused otherwise.
    pub async fn trash(&self, cancel: &CancellationToken, locator: &Locator) -> Result<()> {
        self.check_writable()?;
        cancellable(cancel, self.trash_block(locator.hash())).await
    }

    async fn trash_block(&self, key: &str) -> Result<()> {
        let touched = self.mtime_block(key).await?;
        let now = self.clock.now();
        if now - touched < self.trash_margin {
            debug!("{}: not trashing {key}, touched at {touched}", self.name);
            return Ok(());
        }

        if self.trash_lifetime.is_zero() {
            if !self.unsafe_delete {
                return Err(Error::TrashDisabled(self.name.clone()));
            }
            return self.bucket_delete(key).await;
        }

        self.check_race_window(key, now).await?;
        self.bucket_copy(&trash_key(key), key).await?;
        self.bucket_delete(key).await
    }

    /// Refuse to rewrite a trash marker that EmptyTrash may delete while we
    /// are still deleting the data
    async fn check_race_window(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(trash) = self.head_opt(&trash_key(key)).await? else {
            return Ok(());
        };
        let safe_until = trash.last_modified + self.trash_lifetime;
        if safe_until - (now + self.race_window) <= TimeDelta::zero() {
            return Err(Error::TrashRace {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Restore a trashed block
    ///
    /// Succeeds whenever the data still exists, in trash or in place.
    pub async fn untrash(&self, cancel: &CancellationToken, locator: &Locator) -> Result<()> {
        self.check_writable()?;
        cancellable(cancel, self.untrash_block(locator.hash())).await
    }

    async fn untrash_block(&self, key: &str) -> Result<()> {
        if self.head_opt(&trash_key(key)).await?.is_some() {
            self.bucket_copy(key, &trash_key(key)).await?;
        } else if self.head_opt(key).await?.is_none() {
            return Err(Error::not_found(key));
        }
        self.bucket_put(&recent_key(key), Bytes::new()).await
    }

    /// Undo a Trash that raced with a Put or Touch
    ///
    /// Returns true if the data was restored from trash.
    async fn fix_race(&self, key: &str) -> Result<bool> {
        let Some(trash) = self.head_opt(&trash_key(key)).await? else {
            return Ok(false);
        };
        let Some(recent) = self.head_opt(&recent_key(key)).await? else {
            return Ok(false);
        };
        let age_when_trashed = trash.last_modified - recent.last_modified;
        if age_when_trashed >= self.trash_margin {
            // Not written since it became eligible for trash.
            return Ok(false);
        }
        info!(
            "{}: {key} trashed at {} but touched at {}; restoring from trash",
            self.name, trash.last_modified, recent.last_modified
        );
        self.bucket_copy(key, &trash_key(key)).await?;
        Ok(true)
    }

    /// Delete trashed blocks whose trash marker outlived `trash_lifetime`
    ///
    /// Trash markers that show evidence of a race with a write are resolved
    /// in the block's favour instead of being deleted. Per-block failures
    /// are logged and do not stop the sweep.
    pub async fn empty_trash(&self, cancel: &CancellationToken) -> Result<TrashSweepStats> {
        self.check_writable()?;
        let start = self.clock.now();
        let entries = cancellable(cancel, self.bucket_list(TRASH)).await?;

        let blocks_in_trash = AtomicU64::new(0);
        let bytes_in_trash = AtomicU64::new(0);
        let blocks_deleted = AtomicU64::new(0);
        let bytes_deleted = AtomicU64::new(0);

        let sweep = futures::stream::iter(entries).for_each_concurrent(
            self.delete_concurrency,
            |entry| {
                let (blocks_in_trash, bytes_in_trash) = (&blocks_in_trash, &bytes_in_trash);
                let (blocks_deleted, bytes_deleted) = (&blocks_deleted, &bytes_deleted);
                async move {
                    if !is_block_hash(&entry.key[TRASH.len()..]) {
                        return;
                    }
                    blocks_in_trash.fetch_add(1, AtomicOrdering::Relaxed);
                    bytes_in_trash.fetch_add(entry.size, AtomicOrdering::Relaxed);
                    match self.sweep_entry(&entry, start).await {
                        Ok(true) => {
                            blocks_deleted.fetch_add(1, AtomicOrdering::Relaxed);
                            bytes_deleted.fetch_add(entry.size, AtomicOrdering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e) => warn!("{}: EmptyTrash: {}: {e}", self.name, entry.key),
                    }
                }
            },
        );
        cancellable(cancel, async {
            sweep.await;
            Ok(())
        })
        .await?;

        let stats = TrashSweepStats {
            blocks_in_trash: blocks_in_trash.into_inner(),
            bytes_in_trash: bytes_in_trash.into_inner(),
            blocks_deleted: blocks_deleted.into_inner(),
            bytes_deleted: bytes_deleted.into_inner(),
        };
        info!(
            "{}: EmptyTrash: deleted {} of {} blocks ({} of {} bytes)",
            self.name,
            stats.blocks_deleted,
            stats.blocks_in_trash,
            stats.bytes_deleted,
            stats.bytes_in_trash
        );
        Ok(stats)
    }

    /// Returns true if the trash entry was deleted
    async fn sweep_entry(&self, trash: &ObjectInfo, start: DateTime<Utc>) -> Result<bool> {
        let key = &trash.key[TRASH.len()..];
        let Some(recent) = self.head_opt(&recent_key(key)).await? else {
            warn!("{}: EmptyTrash: {key} is in trash but has no recent marker; untrashing", self.name);
            self.untrash_block(key).await?;
            return Ok(false);
        };

        if trash.last_modified - recent.last_modified < self.trash_margin {
            if start - recent.last_modified >= self.trash_margin - self.race_window {
                // The recent marker is too old to keep the block from being
                // trashed again once the trash copy is gone.
                info!("{}: EmptyTrash: old race on {key}; restoring and touching", self.name);
                self.fix_race(key).await?;
                self.touch_block(key).await?;
                return Ok(false);
            }
            if self.head_opt(key).await?.is_none() {
                info!("{}: EmptyTrash: recent race on {key}; restoring", self.name);
                self.fix_race(key).await?;
                return Ok(false);
            }
        }

        if start - trash.last_modified < self.trash_lifetime {
            return Ok(false);
        }

        self.bucket_delete(&trash.key).await?;
        if self.head_opt(&trash.key).await?.is_some() {
            warn!("{}: EmptyTrash: {} still visible after delete", self.name, trash.key);
            return Ok(true);
        }
        // A block rewritten since it was trashed keeps its marker.
        if self.head_opt(key).await?.is_none() {
            self.bucket_delete(&recent_key(key)).await?;
        }
        Ok(true)
    }

    /// Object metadata for a raw bucket key
    pub async fn head(&self, key: &str) -> Result<ObjectInfo> {
        self.bucket_head(key).await
    }

    /// Write `<hash>+<size> <timestamp-ns>` lines for stored blocks whose
    /// hash starts with `prefix`, in hash order
    pub async fn index_to<W>(&self, cancel: &CancellationToken, prefix: &str, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        cancellable(cancel, async {
            let data = self.bucket_list(prefix).await?;
            let mut recent = self
                .bucket_list(&recent_key(prefix))
                .await?
                .into_iter()
                .peekable();

            for obj in data.into_iter().filter(|o| is_block_hash(&o.key)) {
                let mut stamp = obj.last_modified;
                while let Some(marker) = recent.peek() {
                    match marker.key[RECENT.len()..].cmp(obj.key.as_str()) {
                        Ordering::Less => {
                            recent.next();
                        }
                        Ordering::Equal => {
                            stamp = marker.last_modified;
                            recent.next();
                            break;
                        }
                        Ordering::Greater => break,
                    }
                }
                let nanos = stamp.timestamp().saturating_mul(1_000_000_000);
                let line = format!("{}+{} {nanos}\n", obj.key, obj.size);
                writer.write_all(line.as_bytes()).await?;
            }
            writer.flush().await?;
            Ok(())
        })
        .await
    }

    async fn head_opt(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self.bucket_head(key).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn bucket_head(&self, key: &str) -> Result<ObjectInfo> {
        self.stats.tick(Op::Head);
        self.bucket
            .head(key)
            .await
            .inspect_err(|e| self.stats.record_error(e))
    }

    async fn bucket_get(&self, key: &str) -> Result<Bytes> {
        self.stats.tick(Op::Get);
        let data = self
            .bucket
            .get(key)
            .await
            .inspect_err(|e| self.stats.record_error(e))?;
        self.stats.add_in(data.len());
        Ok(data)
    }

    async fn bucket_put(&self, key: &str, data: Bytes) -> Result<()> {
        self.stats.tick(Op::Put);
        let len = data.len();
        self.bucket
            .put(key, data)
            .await
            .inspect_err(|e| self.stats.record_error(e))?;
        self.stats.add_out(len);
        Ok(())
    }

    async fn bucket_copy(&self, dst: &str, src: &str) -> Result<()> {
        self.stats.tick(Op::Put);
        self.bucket
            .copy(dst, src)
            .await
            .inspect_err(|e| self.stats.record_error(e))
    }

    async fn bucket_delete(&self, key: &str) -> Result<()> {
        self.stats.tick(Op::Delete);
        self.bucket
            .delete(key)
            .await
            .inspect_err(|e| self.stats.record_error(e))
    }

    async fn bucket_list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.stats.tick(Op::List);
        self.bucket
            .list(prefix)
            .await
            .inspect_err(|e| self.stats.record_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;
    use async_trait::async_trait;
    use keepio_common::ManualClock;

    const HOUR: u64 = 3600;

    struct Harness {
        clock: Arc<ManualClock>,
        bucket: Arc<MemoryBucket>,
        volume: Volume,
        t0: DateTime<Utc>,
        cancel: CancellationToken,
    }

    fn config() -> VolumeConfig {
        VolumeConfig {
            name: "vol0".to_string(),
            trash_margin_secs: HOUR,
            trash_lifetime_secs: HOUR,
            race_window_secs: 5 * 60,
            ..Default::default()
        }
    }

    fn harness_with(config: &VolumeConfig) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let t0 = Utc::now();
        clock.set(t0);
        let bucket = Arc::new(MemoryBucket::new(clock.clone()));
        let volume = Volume::new(config, bucket.clone(), clock.clone()).unwrap();
        Harness {
            clock,
            bucket,
            volume,
            t0,
            cancel: CancellationToken::new(),
        }
    }

    fn harness() -> Harness {
        harness_with(&config())
    }

    impl Harness {
        /// Write `key` with a last-modified time of `t0 - ago`
        async fn put_at(&self, ago: Option<TimeDelta>, key: &str, data: &[u8]) {
            let Some(ago) = ago else { return };
            self.clock.set(self.t0 - ago);
            self.bucket
                .put(key, Bytes::copy_from_slice(data))
                .await
                .unwrap();
            self.clock.set(self.t0);
        }

        async fn exists(&self, key: &str) -> bool {
            self.bucket.head(key).await.is_ok()
        }
    }

    fn mins(m: i64) -> Option<TimeDelta> {
        Some(TimeDelta::minutes(m))
    }

    fn hours(h: i64) -> Option<TimeDelta> {
        Some(TimeDelta::hours(h))
    }

    struct Scenario {
        label: &'static str,
        data: Option<TimeDelta>,
        recent: Option<TimeDelta>,
        trash: Option<TimeDelta>,
        can_get: bool,
        can_trash: bool,
        can_get_after_trash: bool,
        can_untrash: bool,
        have_trash_after_empty: bool,
        fresh_after_empty: bool,
    }

    #[rustfmt::skip]
    fn scenarios() -> Vec<Scenario> {
        let s = |label, data, recent, trash, flags: [bool; 6]| Scenario {
            label, data, recent, trash,
            can_get: flags[0],
            can_trash: flags[1],
            can_get_after_trash: flags[2],
            can_untrash: flags[3],
            have_trash_after_empty: flags[4],
            fresh_after_empty: flags[5],
        };
        let none = None;
        vec![
            s("no related objects", none, none, none,
              [false, false, false, false, false, false]),
            s("no recent marker: trash adopts it as fresh and does nothing", hours(48), none, none,
              [true, true, true, true, false, false]),
            s("old enough to be eligible for trash", hours(24), hours(2), none,
              [true, true, false, true, false, false]),
            s("too young to be eligible for trash", hours(24), mins(30), none,
              [true, true, true, true, false, false]),
            s("data and trash after a recent trash/put race", hours(24), mins(3), mins(2),
              [true, true, true, true, true, false]),
            s("data and trash, trash nearly eligible for deletion", hours(24), hours(12), mins(59),
              [true, false, true, true, true, false]),
            s("data and trash, trash eligible for deletion", hours(24), hours(12), mins(61),
              [true, false, true, true, false, false]),
            s("data and trash after old put/trash race: unsafe to empty", hours(24), hours(12), hours(12),
              [true, false, true, true, true, true]),
            s("data and trash, made safe by an earlier restore and touch", Some(TimeDelta::seconds(1)), Some(TimeDelta::seconds(1)), hours(12),
              [true, true, true, true, false, false]),
            s("data and trash after an interrupted trash", hours(24), hours(24), hours(12),
              [true, false, true, true, false, false]),
            s("trash, not yet eligible for deletion", none, hours(12), mins(1),
              [false, false, false, true, true, false]),
            s("trash, not yet eligible for deletion, prone to races", none, hours(12), mins(59),
              [false, false, false, true, true, false]),
            s("trash, eligible for deletion", none, hours(12), hours(2),
              [false, false, false, true, false, false]),
            s("trashed during a race, detected before trash lifetime", none, mins(30), mins(29),
              [true, false, true, true, true, false]),
            s("trashed during a race, rescued despite reaching trash lifetime", none, mins(90), mins(89),
              [true, false, true, true, true, false]),
            s("trash without recent marker: repaired by untrashing", none, none, mins(1),
              [false, false, false, true, true, true]),
        ]
    }

    /// Lay down a fresh block in the scenario's state
    async fn lay_down(h: &Harness, sc: &Scenario, next: &mut u32) -> (Locator, Vec<u8>) {
        *next += 1;
        let data = next.to_string().into_bytes();
        let loc = Locator::compute(&data);
        let key = loc.hash();
        h.put_at(sc.data, key, &data).await;
        h.put_at(sc.recent, &recent_key(key), b"").await;
        h.put_at(sc.trash, &trash_key(key), &data).await;
        (loc, data)
    }

    #[tokio::test]
    async fn test_backend_states() {
        let mut next = 0u32;
        for sc in scenarios() {
            // Each check mutates state, so every one gets a fresh block.
            let h = harness();

            let (loc, _) = lay_down(&h, &sc, &mut next).await;
            let got = h.volume.get(&h.cancel, &loc).await;
            assert_eq!(got.is_ok(), sc.can_get, "{}: get", sc.label);
            if let Err(e) = got {
                assert!(e.is_not_found(), "{}: get error {e}", sc.label);
            }

            let (loc, _) = lay_down(&h, &sc, &mut next).await;
            let trashed = h.volume.trash(&h.cancel, &loc).await;
            assert_eq!(trashed.is_ok(), sc.can_trash, "{}: trash {trashed:?}", sc.label);
            let got = h.volume.get(&h.cancel, &loc).await;
            assert_eq!(got.is_ok(), sc.can_get_after_trash, "{}: get after trash", sc.label);

            let (loc, data) = lay_down(&h, &sc, &mut next).await;
            let untrashed = h.volume.untrash(&h.cancel, &loc).await;
            assert_eq!(untrashed.is_ok(), sc.can_untrash, "{}: untrash", sc.label);
            if sc.data.is_some() || sc.trash.is_some() {
                let got = h.volume.get(&h.cancel, &loc).await.unwrap();
                assert_eq!(got.as_ref(), data.as_slice(), "{}: get after untrash", sc.label);
            }

            let (loc, _) = lay_down(&h, &sc, &mut next).await;
            h.volume.empty_trash(&h.cancel).await.unwrap();
            assert_eq!(
                h.exists(&trash_key(loc.hash())).await,
                sc.have_trash_after_empty,
                "{}: trash after empty",
                sc.label
            );
            if sc.fresh_after_empty {
                let t = h.volume.mtime(&h.cancel, &loc).await.unwrap();
                assert_eq!(t, h.t0, "{}: mtime after empty", sc.label);
            }

            let (loc, data) = lay_down(&h, &sc, &mut next).await;
            h.volume
                .put(&h.cancel, &loc, Bytes::from(data))
                .await
                .unwrap();
            assert_eq!(h.volume.mtime(&h.cancel, &loc).await.unwrap(), h.t0, "{}: put", sc.label);
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_and_idempotence() {
        let h = harness();
        let data = Bytes::from_static(b"foo");
        let loc = Locator::compute(&data);
        for _ in 0..3 {
            h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
            assert_eq!(h.volume.get(&h.cancel, &loc).await.unwrap(), data);
        }
        assert!(h.volume.compare(&h.cancel, &loc, b"foo").await.unwrap());
        assert!(!h.volume.compare(&h.cancel, &loc, b"bar").await.unwrap());
        assert_eq!(h.bucket.len(), 2);
    }

    #[tokio::test]
    async fn test_rescue_after_rewrite() {
        let h = harness();
        let data = Bytes::from_static(b"rescued");
        let loc = Locator::compute(&data);

        h.clock.set(h.t0 - TimeDelta::hours(24));
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
        h.clock.set(h.t0 - TimeDelta::hours(12));
        h.volume.trash(&h.cancel, &loc).await.unwrap();
        assert!(h.volume.get(&h.cancel, &loc).await.unwrap_err().is_not_found());

        h.clock.set(h.t0 - TimeDelta::minutes(5));
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();

        h.clock.set(h.t0);
        let stats = h.volume.empty_trash(&h.cancel).await.unwrap();
        assert_eq!(stats.blocks_in_trash, 1);
        assert_eq!(h.volume.get(&h.cancel, &loc).await.unwrap(), data);
        assert_eq!(
            h.volume.mtime(&h.cancel, &loc).await.unwrap(),
            h.t0 - TimeDelta::minutes(5)
        );
    }

    #[tokio::test]
    async fn test_trash_inside_margin_is_noop() {
        let h = harness();
        let data = Bytes::from_static(b"young");
        let loc = Locator::compute(&data);

        h.clock.set(h.t0 - TimeDelta::minutes(30));
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
        h.clock.set(h.t0);
        h.volume.trash(&h.cancel, &loc).await.unwrap();

        assert!(!h.exists(&trash_key(loc.hash())).await);
        assert_eq!(h.volume.get(&h.cancel, &loc).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_eligible_block_is_deleted() {
        let h = harness();
        let data = Bytes::from_static(b"garbage");
        let loc = Locator::compute(&data);

        h.clock.set(h.t0 - TimeDelta::hours(12));
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
        h.clock.set(h.t0 - TimeDelta::hours(2));
        h.volume.trash(&h.cancel, &loc).await.unwrap();

        h.clock.set(h.t0);
        let stats = h.volume.empty_trash(&h.cancel).await.unwrap();
        assert_eq!(stats.blocks_deleted, 1);
        assert_eq!(stats.bytes_deleted, data.len() as u64);
        assert!(h.volume.get(&h.cancel, &loc).await.unwrap_err().is_not_found());
        assert!(h.bucket.is_empty());
    }

    #[tokio::test]
    async fn test_untrash_restores_block() {
        let h = harness();
        let data = Bytes::from_static(b"oops");
        let loc = Locator::compute(&data);

        h.clock.set(h.t0 - TimeDelta::hours(3));
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
        h.clock.set(h.t0);
        h.volume.trash(&h.cancel, &loc).await.unwrap();
        assert!(h.volume.get(&h.cancel, &loc).await.is_err());

        h.volume.untrash(&h.cancel, &loc).await.unwrap();
        assert_eq!(h.volume.get(&h.cancel, &loc).await.unwrap(), data);
        assert_eq!(h.volume.mtime(&h.cancel, &loc).await.unwrap(), h.t0);

        let missing = Locator::compute(b"never stored");
        assert!(h.volume.untrash(&h.cancel, &missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_zero_lifetime_requires_unsafe_delete() {
        let mut cfg = config();
        cfg.trash_lifetime_secs = 0;
        let h = harness_with(&cfg);
        let data = Bytes::from_static(b"now");
        let loc = Locator::compute(&data);
        h.clock.set(h.t0 - TimeDelta::hours(2));
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
        h.clock.set(h.t0);
        assert!(matches!(
            h.volume.trash(&h.cancel, &loc).await,
            Err(Error::TrashDisabled(_))
        ));

        cfg.unsafe_delete = true;
        let h = harness_with(&cfg);
        h.clock.set(h.t0 - TimeDelta::hours(2));
        h.volume.put(&h.cancel, &loc, data).await.unwrap();
        h.clock.set(h.t0);
        h.volume.trash(&h.cancel, &loc).await.unwrap();
        assert!(!h.exists(&trash_key(loc.hash())).await);
        assert!(h.volume.get(&h.cancel, &loc).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let mut cfg = config();
        cfg.read_only = true;
        let h = harness_with(&cfg);
        let loc = Locator::compute(b"ro");
        let err = h
            .volume
            .put(&h.cancel, &loc, Bytes::from_static(b"ro"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodDisabled(_)));
        assert!(h.volume.trash(&h.cancel, &loc).await.is_err());
        assert!(h.volume.empty_trash(&h.cancel).await.is_err());
        assert!(!h.volume.writable());
    }

    #[tokio::test]
    async fn test_index_lists_blocks_with_marker_times() {
        let h = harness();
        let a = Bytes::from_static(b"alpha");
        let b = Bytes::from_static(b"beta");
        let (la, lb) = (Locator::compute(&a), Locator::compute(&b));

        h.clock.set(h.t0 - TimeDelta::hours(1));
        h.volume.put(&h.cancel, &la, a.clone()).await.unwrap();
        h.volume.put(&h.cancel, &lb, b.clone()).await.unwrap();
        h.clock.set(h.t0);
        h.volume.touch(&h.cancel, &la).await.unwrap();

        let mut out = Vec::new();
        h.volume.index_to(&h.cancel, "", &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let expect = |loc: &Locator, t: DateTime<Utc>| {
            format!("{}+{} {}", loc.hash(), loc.size(), t.timestamp() * 1_000_000_000)
        };
        let mut want = vec![
            expect(&la, h.t0),
            expect(&lb, h.t0 - TimeDelta::hours(1)),
        ];
        want.sort();
        assert_eq!(lines, want);

        let mut out = Vec::new();
        let prefix = &la.hash()[..3];
        h.volume.index_to(&h.cancel, prefix, &mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with(la.hash()));
    }

    #[tokio::test]
    async fn test_mtime_creates_missing_marker() {
        let h = harness();
        let data = b"legacy";
        let loc = Locator::compute(data);
        h.put_at(hours(48), loc.hash(), data).await;

        assert_eq!(h.volume.mtime(&h.cancel, &loc).await.unwrap(), h.t0);
        assert!(h.exists(&recent_key(loc.hash())).await);
    }

    #[tokio::test]
    async fn test_stats_count_bucket_calls() {
        let h = harness();
        let data = Bytes::from_static(b"counted");
        let loc = Locator::compute(&data);
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();
        h.volume.get(&h.cancel, &loc).await.unwrap();
        let _ = h.volume.get(&h.cancel, &Locator::compute(b"missing")).await;

        let snap = h.volume.stats().snapshot();
        assert_eq!(snap.put_ops, 2);
        assert_eq!(snap.out_bytes, data.len() as u64);
        assert_eq!(snap.in_bytes, data.len() as u64);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn test_head_reports_objects() {
        let h = harness();
        let data = Bytes::from_static(b"headed");
        let loc = Locator::compute(&data);
        h.volume.put(&h.cancel, &loc, data.clone()).await.unwrap();

        let info = h.volume.head(loc.hash()).await.unwrap();
        assert_eq!(info.size, data.len() as u64);
        assert_eq!(info.last_modified, h.t0);
        assert_eq!(h.volume.head(&recent_key(loc.hash())).await.unwrap().size, 0);
        assert!(h.volume.head(&trash_key(loc.hash())).await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_puts_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::open_dir(&VolumeConfig {
            dir: dir.path().to_path_buf(),
            ..config()
        })
        .await
        .unwrap();

        for i in 0..10u8 {
            let data = Bytes::from(vec![i; 32 * 1024 * 1024]);
            let loc = Locator::compute(&data);
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(3)).await;
                trigger.cancel();
            });
            let _ = volume.put(&cancel, &loc, data).await;
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while crate::dir::tests::count_temp_files(dir.path()) > 0
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        volume.empty_trash(&CancellationToken::new()).await.unwrap();
        assert_eq!(crate::dir::tests::count_temp_files(dir.path()), 0);
    }

    /// Bucket whose reads never complete
    struct StallBucket;

    #[async_trait]
    impl ObjectBucket for StallBucket {
        async fn head(&self, _key: &str) -> Result<ObjectInfo> {
            futures::future::pending().await
        }
        async fn get(&self, _key: &str) -> Result<Bytes> {
            futures::future::pending().await
        }
        async fn put(&self, _key: &str, _data: Bytes) -> Result<()> {
            futures::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            futures::future::pending().await
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_stalled_backend() {
        let volume = Volume::new(&config(), Arc::new(StallBucket), Arc::new(SystemClock)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let loc = Locator::compute(b"stuck");
        assert!(volume.get(&cancel, &loc).await.unwrap_err().is_cancelled());
        assert!(volume.empty_trash(&cancel).await.unwrap_err().is_cancelled());
    }
}
