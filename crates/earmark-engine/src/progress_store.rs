//! Persisted store for playback progress records.
//!
//! Same persistence shape as the content store: one JSON document keyed
//! by item id behind an async lock. Carries the merge rules for the
//! remote progress feed: a remote record only overwrites a local one
//! when its update timestamp is strictly newer, since the local record
//! may hold unsynced listening time the server has not seen yet.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{ProgressRecord, RemoteProgress};

/// File name of the persisted progress document inside the data dir.
pub const PROGRESS_STORE_FILE: &str = "progress_records.json";

/// Persisted store of one [`ProgressRecord`] per item.
pub struct ProgressStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, ProgressRecord>>,
    watch_tx: watch::Sender<Vec<ProgressRecord>>,
}

impl ProgressStore {
    /// Open the store backed by `path`, loading any existing document.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing document cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_document(&path)?;
        info!(
            "Opened progress store at {} ({} records)",
            path.display(),
            records.len()
        );
        let snapshot: Vec<ProgressRecord> = records.values().cloned().collect();
        let (watch_tx, _) = watch::channel(snapshot);

        Ok(Self {
            path,
            records: RwLock::new(records),
            watch_tx,
        })
    }

    /// Get one record by item id.
    pub async fn get(&self, item_id: &str) -> Option<ProgressRecord> {
        let records = self.records.read().await;
        records.get(item_id).cloned()
    }

    /// Get the record for an item, creating a fresh one on first playback.
    pub async fn get_or_create(
        &self,
        item_id: &str,
        total_duration_secs: f64,
    ) -> Result<ProgressRecord> {
        {
            let records = self.records.read().await;
            if let Some(existing) = records.get(item_id) {
                return Ok(existing.clone());
            }
        }
        let record = ProgressRecord::new(item_id, total_duration_secs);
        debug!("Creating progress record for {}", item_id);
        self.save(record.clone()).await?;
        Ok(record)
    }

    /// Insert-or-replace a record by item id.
    ///
    /// A fraction at or above 1.0 also marks the record finished.
    pub async fn save(&self, mut record: ProgressRecord) -> Result<()> {
        if record.fraction >= 1.0 {
            record.is_finished = true;
        }
        let mut records = self.records.write().await;
        records.insert(record.item_id.clone(), record);
        self.persist(&records)?;
        self.publish(&records);
        Ok(())
    }

    /// Set or clear the finished flag for an item.
    ///
    /// Marking finished forces the fraction to 1.0, creating a record if
    /// none exists yet. Un-marking deletes the record entirely: "not
    /// finished" removes progress rather than resetting it to zero.
    pub async fn update_finished(&self, item_id: &str, is_finished: bool) -> Result<()> {
        if is_finished {
            let mut record = self
                .get(item_id)
                .await
                .unwrap_or_else(|| ProgressRecord::new(item_id, 0.0));
            record.fraction = 1.0;
            record.is_finished = true;
            record.last_update = Utc::now();
            info!("Marking {} finished", item_id);
            self.save(record).await
        } else {
            let mut records = self.records.write().await;
            if records.remove(item_id).is_some() {
                info!("Un-marking {} finished; progress record removed", item_id);
                self.persist(&records)?;
                self.publish(&records);
            }
            Ok(())
        }
    }

    /// Merge the remote progress feed into the local store.
    ///
    /// Unknown items are inserted. Known items are overwritten only when
    /// the remote update timestamp is strictly newer than the local one;
    /// ties favor the local record. The locally-accumulated unsynced
    /// listening counter is never touched by a remote merge. `skip_item`
    /// exempts the currently-playing item, whose local state is
    /// authoritative while playback is active.
    ///
    /// Returns the number of records inserted or updated.
    pub async fn sync_from_remote(
        &self,
        remote: Vec<RemoteProgress>,
        skip_item: Option<&str>,
    ) -> Result<usize> {
        let mut records = self.records.write().await;
        let mut applied = 0;

        for incoming in remote {
            if skip_item == Some(incoming.item_id.as_str()) {
                debug!("Skipping remote merge for playing item {}", incoming.item_id);
                continue;
            }
            match records.get_mut(&incoming.item_id) {
                None => {
                    records.insert(incoming.item_id.clone(), incoming.into_record());
                    applied += 1;
                }
                Some(local) => {
                    if incoming.last_update > local.last_update {
                        local.position_secs = incoming.position_secs;
                        local.total_duration_secs = incoming.total_duration_secs;
                        local.fraction = incoming.fraction;
                        local.is_finished = incoming.is_finished;
                        local.last_played_at = incoming.last_update;
                        local.last_update = incoming.last_update;
                        applied += 1;
                    }
                }
            }
        }

        if applied > 0 {
            info!("Merged {} remote progress records", applied);
            self.persist(&records)?;
            self.publish(&records);
        }
        Ok(applied)
    }

    /// All records, in item-id order.
    pub async fn all(&self) -> Vec<ProgressRecord> {
        let records = self.records.read().await;
        records.values().cloned().collect()
    }

    /// Subscribe to the record list.
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<Vec<ProgressRecord>> {
        self.watch_tx.subscribe()
    }

    fn publish(&self, records: &BTreeMap<String, ProgressRecord>) {
        self.watch_tx
            .send_replace(records.values().cloned().collect());
    }

    fn persist(&self, records: &BTreeMap<String, ProgressRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| Error::local_storage(parent, e))?;
        }
        let content = serde_json::to_string_pretty(records)?;
        fs::write(&self.path, content).map_err(|e| Error::local_storage(&self.path, e))
    }
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn load_document(path: &Path) -> Result<BTreeMap<String, ProgressRecord>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path).map_err(|e| Error::local_storage(path, e))?;
    match serde_json::from_str(&content) {
        Ok(records) => Ok(records),
        Err(e) => {
            warn!(
                "Progress document at {} is unreadable ({}), starting empty",
                path.display(),
                e
            );
            Ok(BTreeMap::new())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn remote(item_id: &str, position: f64, updated: i64) -> RemoteProgress {
        RemoteProgress {
            item_id: item_id.to_string(),
            position_secs: position,
            total_duration_secs: 300.0,
            fraction: position / 300.0,
            is_finished: false,
            last_update: ts(updated),
        }
    }

    fn store_in(dir: &TempDir) -> ProgressStore {
        ProgressStore::open(dir.path().join(PROGRESS_STORE_FILE)).expect("open store")
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        assert!(store.get("book-1").await.is_none());
        let created = store.get_or_create("book-1", 300.0).await.expect("create");
        assert_eq!(created.total_duration_secs, 300.0);
        assert_eq!(created.position_secs, 0.0);

        // Second call returns the stored record, not a fresh one.
        let mut updated = created.clone();
        updated.position_secs = 42.0;
        store.save(updated).await.expect("save");
        let again = store.get_or_create("book-1", 300.0).await.expect("get");
        assert_eq!(again.position_secs, 42.0);
    }

    #[tokio::test]
    async fn test_save_forces_finished_at_full_fraction() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let mut record = ProgressRecord::new("book-1", 300.0);
        record.fraction = 1.0;
        store.save(record).await.expect("save");

        let stored = store.get("book-1").await.expect("record");
        assert!(stored.is_finished);
    }

    #[tokio::test]
    async fn test_mark_finished_creates_record() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        store.update_finished("book-1", true).await.expect("mark");
        let stored = store.get("book-1").await.expect("record created");
        assert_eq!(stored.fraction, 1.0);
        assert!(stored.is_finished);
    }

    #[tokio::test]
    async fn test_unmark_finished_deletes_record() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        store.update_finished("book-1", true).await.expect("mark");
        assert!(store.get("book-1").await.is_some());

        // Un-marking removes the record entirely rather than zeroing it.
        store.update_finished("book-1", false).await.expect("unmark");
        assert!(store.get("book-1").await.is_none());

        // Un-marking an unknown item is a no-op.
        store.update_finished("book-2", false).await.expect("noop");
    }

    #[tokio::test]
    async fn test_sync_from_remote_inserts_unknown() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let applied = store
            .sync_from_remote(vec![remote("book-1", 120.0, 1000)], None)
            .await
            .expect("sync");
        assert_eq!(applied, 1);
        let stored = store.get("book-1").await.expect("record");
        assert_eq!(stored.position_secs, 120.0);
        assert_eq!(stored.unsynced_listening_secs, 0.0);
    }

    #[tokio::test]
    async fn test_sync_from_remote_strictly_newer_wins() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let mut local = ProgressRecord::new("book-1", 300.0);
        local.position_secs = 100.0;
        local.unsynced_listening_secs = 15.0;
        local.last_update = ts(2000);
        store.save(local).await.expect("save");

        // Older remote: ignored.
        let applied = store
            .sync_from_remote(vec![remote("book-1", 50.0, 1000)], None)
            .await
            .expect("sync");
        assert_eq!(applied, 0);
        let stored = store.get("book-1").await.expect("record");
        assert_eq!(stored.position_secs, 100.0);
        assert_eq!(stored.last_update, ts(2000));

        // Equal timestamp: tie favors local.
        let applied = store
            .sync_from_remote(vec![remote("book-1", 50.0, 2000)], None)
            .await
            .expect("sync");
        assert_eq!(applied, 0);

        // Strictly newer remote: overwrites, but keeps the unsynced counter.
        let applied = store
            .sync_from_remote(vec![remote("book-1", 200.0, 3000)], None)
            .await
            .expect("sync");
        assert_eq!(applied, 1);
        let stored = store.get("book-1").await.expect("record");
        assert_eq!(stored.position_secs, 200.0);
        assert_eq!(stored.last_update, ts(3000));
        assert_eq!(stored.unsynced_listening_secs, 15.0);
    }

    #[tokio::test]
    async fn test_sync_from_remote_skips_playing_item() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let mut local = ProgressRecord::new("book-1", 300.0);
        local.position_secs = 100.0;
        local.last_update = ts(1000);
        store.save(local).await.expect("save");

        let applied = store
            .sync_from_remote(vec![remote("book-1", 10.0, 9000)], Some("book-1"))
            .await
            .expect("sync");
        assert_eq!(applied, 0);
        let stored = store.get("book-1").await.expect("record");
        assert_eq!(stored.position_secs, 100.0);
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = store_in(&dir);
            store.update_finished("book-1", true).await.expect("mark");
        }
        let reopened = store_in(&dir);
        assert!(reopened.get("book-1").await.expect("record").is_finished);
    }
}
