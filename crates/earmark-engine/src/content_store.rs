//! Persisted store for content records.
//!
//! One JSON document keyed by item id, loaded at construction and kept
//! in memory behind an async lock. Mutations go through upsert, the
//! merge operation, or deletion; every mutation persists the document
//! and republishes the observable snapshot.
//!
//! Observation uses a `watch` channel. While the store is suppressed
//! (the host process is backgrounded and persistence access is unsafe)
//! changes are applied and persisted but not published; unsuppressing
//! publishes the current snapshot once.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::ContentRecord;

/// File name of the persisted content document inside the data dir.
pub const CONTENT_STORE_FILE: &str = "content_records.json";

/// Persisted store of one [`ContentRecord`] per downloadable item.
pub struct ContentStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, ContentRecord>>,
    watch_tx: watch::Sender<Vec<ContentRecord>>,
    suppressed: AtomicBool,
}

impl ContentStore {
    /// Open the store backed by `path`, loading any existing document.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing document cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_document(&path)?;
        info!(
            "Opened content store at {} ({} records)",
            path.display(),
            records.len()
        );
        let snapshot: Vec<ContentRecord> = records.values().cloned().collect();
        let (watch_tx, _) = watch::channel(snapshot);

        Ok(Self {
            path,
            records: RwLock::new(records),
            watch_tx,
            suppressed: AtomicBool::new(false),
        })
    }

    /// Get one record by item id.
    pub async fn get(&self, item_id: &str) -> Option<ContentRecord> {
        let records = self.records.read().await;
        records.get(item_id).cloned()
    }

    /// Insert-or-replace a record by item id.
    pub async fn put(&self, record: ContentRecord) -> Result<()> {
        let mut records = self.records.write().await;
        debug!("Upserting content record for {}", record.item_id);
        records.insert(record.item_id.clone(), record);
        self.persist(&records)?;
        self.publish(&records);
        Ok(())
    }

    /// Merge freshly-fetched remote metadata into any existing record,
    /// or insert it when the item is unknown. Returns the merged record.
    pub async fn merge_remote(&self, incoming: ContentRecord) -> Result<ContentRecord> {
        let mut records = self.records.write().await;
        let merged = match records.get_mut(&incoming.item_id) {
            Some(existing) => {
                existing.merge_from(incoming);
                existing.clone()
            }
            None => {
                records.insert(incoming.item_id.clone(), incoming.clone());
                incoming
            }
        };
        debug!("Merged remote metadata for {}", merged.item_id);
        self.persist(&records)?;
        self.publish(&records);
        Ok(merged)
    }

    /// Record a freshly-downloaded local file for one track.
    ///
    /// The update happens under the store lock, so a concurrent
    /// mutation of the same record (a session renewal re-pointing
    /// `session_id`, another track landing) is never lost to a stale
    /// write-back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] when the item or the track
    /// index is unknown.
    pub async fn set_track_local_path(
        &self,
        item_id: &str,
        track_index: u32,
        local_path: PathBuf,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(item_id) else {
            return Err(Error::RecordNotFound(item_id.to_string()));
        };
        let Some(track) = record.tracks.iter_mut().find(|t| t.index == track_index) else {
            return Err(Error::RecordNotFound(format!(
                "{item_id} track {track_index}"
            )));
        };
        debug!(
            "Track {} of {} now resident at {}",
            track_index,
            item_id,
            local_path.display()
        );
        track.local_path = Some(local_path);
        self.persist(&records)?;
        self.publish(&records);
        Ok(())
    }

    /// Drop every track's local path for an item whose files are gone
    /// from disk. Unknown items are a no-op.
    pub async fn clear_track_paths(&self, item_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(item_id) {
            let mut changed = false;
            for track in &mut record.tracks {
                if track.local_path.take().is_some() {
                    changed = true;
                }
            }
            if changed {
                debug!("Cleared local track paths for {}", item_id);
                self.persist(&records)?;
                self.publish(&records);
            }
        }
        Ok(())
    }

    /// Remove a record, returning it so the caller can purge any
    /// on-disk track files. File cleanup is the caller's responsibility.
    pub async fn delete(&self, item_id: &str) -> Result<Option<ContentRecord>> {
        let mut records = self.records.write().await;
        let removed = records.remove(item_id);
        if removed.is_some() {
            info!("Deleted content record for {}", item_id);
            self.persist(&records)?;
            self.publish(&records);
        }
        Ok(removed)
    }

    /// All records, in item-id order.
    pub async fn all(&self) -> Vec<ContentRecord> {
        let records = self.records.read().await;
        records.values().cloned().collect()
    }

    /// Subscribe to the record list. The receiver holds the latest
    /// published snapshot.
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<Vec<ContentRecord>> {
        self.watch_tx.subscribe()
    }

    /// Suppress or resume snapshot publication.
    ///
    /// While suppressed, mutations persist but do not publish. Resuming
    /// publishes the current snapshot once so observers catch up.
    pub async fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::SeqCst);
        if suppressed {
            debug!("Content store observation suppressed");
        } else {
            let records = self.records.read().await;
            self.watch_tx
                .send_replace(records.values().cloned().collect());
            debug!("Content store observation resumed");
        }
    }

    fn publish(&self, records: &BTreeMap<String, ContentRecord>) {
        if self.suppressed.load(Ordering::SeqCst) {
            return;
        }
        self.watch_tx
            .send_replace(records.values().cloned().collect());
    }

    fn persist(&self, records: &BTreeMap<String, ContentRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| Error::local_storage(parent, e))?;
        }
        let content = serde_json::to_string_pretty(records)?;
        fs::write(&self.path, content).map_err(|e| Error::local_storage(&self.path, e))
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn load_document(path: &Path) -> Result<BTreeMap<String, ContentRecord>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path).map_err(|e| Error::local_storage(path, e))?;
    match serde_json::from_str(&content) {
        Ok(records) => Ok(records),
        Err(e) => {
            // A truncated document from a crash mid-write should not
            // brick the store; start empty and let the server refill it.
            warn!(
                "Content document at {} is unreadable ({}), starting empty",
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
    use crate::model::Track;
    use tempfile::TempDir;

    fn record(item_id: &str) -> ContentRecord {
        ContentRecord {
            item_id: item_id.to_string(),
            title: "A Book".to_string(),
            author: "An Author".to_string(),
            cover_locator: None,
            tracks: vec![Track {
                index: 0,
                duration_secs: 100.0,
                byte_size: Some(1024),
                remote_locator: "https://server/track/0.mp3".to_string(),
                local_path: None,
                last_modified: None,
            }],
            chapters: Vec::new(),
            session_id: Some("sess-1".to_string()),
            session_expiry: None,
        }
    }

    fn store_in(dir: &TempDir) -> ContentStore {
        ContentStore::open(dir.path().join(CONTENT_STORE_FILE)).expect("open store")
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        assert!(store.get("book-1").await.is_none());
        store.put(record("book-1")).await.expect("put");
        assert!(store.get("book-1").await.is_some());

        let removed = store.delete("book-1").await.expect("delete");
        assert_eq!(removed.map(|r| r.item_id), Some("book-1".to_string()));
        assert!(store.get("book-1").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = store_in(&dir);
            store.put(record("book-1")).await.expect("put");
        }
        let reopened = store_in(&dir);
        let rec = reopened.get("book-1").await.expect("record survives reopen");
        assert_eq!(rec.title, "A Book");
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_empty() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(CONTENT_STORE_FILE);
        fs::write(&path, "{not json").expect("write corrupt file");

        let store = ContentStore::open(&path).expect("open survives corruption");
        assert!(store.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_observe_publishes_on_put() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let mut rx = store.observe();

        store.put(record("book-1")).await.expect("put");
        rx.changed().await.expect("change notification");
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_suppression_holds_back_snapshots() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let rx = store.observe();

        store.set_suppressed(true).await;
        store.put(record("book-1")).await.expect("put");
        // No publication while suppressed.
        assert!(rx.borrow().is_empty());

        store.set_suppressed(false).await;
        // Resuming publishes the snapshot the observer missed.
        assert_eq!(rx.borrow().len(), 1);

        // The mutation persisted even while suppressed.
        let reopened = store_in(&dir);
        assert!(reopened.get("book-1").await.is_some());
    }

    #[tokio::test]
    async fn test_merge_remote_inserts_unknown_item() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let merged = store.merge_remote(record("book-1")).await.expect("merge");
        assert_eq!(merged.item_id, "book-1");
        assert!(store.get("book-1").await.is_some());
    }

    #[tokio::test]
    async fn test_set_track_local_path_survives_interleaved_session_change() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        store.put(record("book-1")).await.expect("put");

        // A session renewal lands while the track's download is still
        // in flight.
        let mut renewed = record("book-1");
        renewed.session_id = Some("sess-2".to_string());
        store.merge_remote(renewed).await.expect("merge");

        store
            .set_track_local_path("book-1", 0, PathBuf::from("/files/0.mp3"))
            .await
            .expect("set path");

        // Both writes survive: the renewed session and the new path.
        let rec = store.get("book-1").await.expect("record");
        assert_eq!(rec.session_id.as_deref(), Some("sess-2"));
        assert_eq!(
            rec.tracks[0].local_path.as_deref(),
            Some(Path::new("/files/0.mp3"))
        );
    }

    #[tokio::test]
    async fn test_set_track_local_path_unknown_targets() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        store.put(record("book-1")).await.expect("put");

        let err = store
            .set_track_local_path("ghost", 0, PathBuf::from("/files/0.mp3"))
            .await
            .expect_err("unknown item");
        assert!(matches!(err, Error::RecordNotFound(_)));

        let err = store
            .set_track_local_path("book-1", 9, PathBuf::from("/files/9.mp3"))
            .await
            .expect_err("unknown track");
        assert!(matches!(err, Error::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_clear_track_paths() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let mut existing = record("book-1");
        existing.tracks[0].local_path = Some(PathBuf::from("/files/0.mp3"));
        store.put(existing).await.expect("put");

        store.clear_track_paths("book-1").await.expect("clear");
        let rec = store.get("book-1").await.expect("record");
        assert!(rec.tracks[0].local_path.is_none());

        // Unknown item is a no-op.
        store.clear_track_paths("ghost").await.expect("noop");
    }

    #[tokio::test]
    async fn test_merge_remote_preserves_local_path() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let mut existing = record("book-1");
        existing.tracks[0].local_path = Some(PathBuf::from("/files/0.mp3"));
        store.put(existing).await.expect("put");

        let incoming = record("book-1");
        let merged = store.merge_remote(incoming).await.expect("merge");
        assert_eq!(
            merged.tracks[0].local_path.as_deref(),
            Some(Path::new("/files/0.mp3"))
        );
    }
}
