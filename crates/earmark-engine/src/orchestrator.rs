//! Download orchestrator: owns the work queue of download operations.
//!
//! Exactly one item downloads at a time, strictly FIFO, to bound
//! bandwidth and background-execution budget. The orchestrator tracks
//! live per-item progress, exposes the start/cancel/delete commands,
//! recovers surviving transfers after a process restart through
//! [`DownloadOrchestrator::reconnect`], and sweeps orphaned download
//! directories at startup before accepting any new work.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::content_store::ContentStore;
use crate::download::{DownloadContext, DownloadEvent, DownloadOperation};
use crate::error::{Error, Result};
use crate::model::DownloadState;
use crate::remote::{SessionNegotiator, TrackTransport};

/// Prefix of the deterministic per-item background transfer identifier.
pub const TRANSFER_ID_PREFIX: &str = "download-";

/// The deterministic background transfer identifier for an item.
#[must_use]
pub fn transfer_id(item_id: &str) -> String {
    format!("{TRANSFER_ID_PREFIX}{item_id}")
}

/// Orchestrates download operations over a concurrency-1 FIFO queue.
pub struct DownloadOrchestrator {
    content_store: Arc<ContentStore>,
    negotiator: Arc<dyn SessionNegotiator>,
    download_root: PathBuf,
    session_ttl_hours: u64,
    /// Items that are queued or running, with their cancellation tokens.
    active: Arc<DashMap<String, CancellationToken>>,
    /// Live `item_id -> fraction` table. An entry exists exactly while
    /// an operation is queued or running; absence means not downloading.
    progress: Arc<DashMap<String, f64>>,
    queue_tx: mpsc::UnboundedSender<String>,
    event_tx: mpsc::UnboundedSender<DownloadEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DownloadEvent>>>,
    any_downloading_tx: watch::Sender<bool>,
}

impl DownloadOrchestrator {
    /// Build the orchestrator and start its worker task.
    ///
    /// Sweeps orphaned download directories before the queue accepts any
    /// work, so the cleanup never races an active download.
    ///
    /// # Errors
    ///
    /// Returns an error if the download root cannot be created or the
    /// orphan sweep fails.
    pub async fn new(
        config: &EngineConfig,
        content_store: Arc<ContentStore>,
        negotiator: Arc<dyn SessionNegotiator>,
        transport: Arc<dyn TrackTransport>,
    ) -> Result<Self> {
        let download_root = config.resolved_download_root();
        tokio::fs::create_dir_all(&download_root)
            .await
            .map_err(|e| Error::local_storage(&download_root, e))?;

        cleanup_orphans(&download_root, &content_store).await?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (any_downloading_tx, _) = watch::channel(false);
        let active: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());
        let progress: Arc<DashMap<String, f64>> = Arc::new(DashMap::new());

        let ctx = DownloadContext {
            store: Arc::clone(&content_store),
            transport,
            download_root: download_root.clone(),
            default_track_bytes: config.default_track_bytes,
            events: event_tx.clone(),
            progress: Arc::clone(&progress),
        };
        spawn_worker(ctx, queue_rx, Arc::clone(&active), any_downloading_tx.clone());

        info!(
            "Download orchestrator ready (root: {})",
            download_root.display()
        );

        Ok(Self {
            content_store,
            negotiator,
            download_root,
            session_ttl_hours: config.session_ttl_hours,
            active,
            progress,
            queue_tx,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            any_downloading_tx,
        })
    }

    /// Start downloading an item.
    ///
    /// Negotiates a fresh session with the server, merges the resulting
    /// metadata into the content store, and enqueues the operation.
    /// Returns `false` (a no-op) when the item is already queued or
    /// running.
    pub async fn start_download(&self, item_id: &str) -> Result<bool> {
        match self.active.entry(item_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("Download already active for {}, ignoring start", item_id);
                return Ok(false);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(CancellationToken::new());
            }
        }

        let session = match self.negotiator.start_session(item_id).await {
            Ok(session) => session,
            Err(e) => {
                self.active.remove(item_id);
                return Err(e);
            }
        };
        let expiry = Utc::now() + chrono::Duration::hours(self.session_ttl_hours as i64);
        let record = session.into_record(item_id, Some(expiry));
        if let Err(e) = self.content_store.merge_remote(record).await {
            self.active.remove(item_id);
            return Err(e);
        }

        self.enqueue(item_id);
        info!("Download queued for {}", item_id);
        Ok(true)
    }

    /// Cancel an item's download, whether queued or running.
    ///
    /// Returns `false` (a no-op) when the item has no active download.
    /// Safe to call at any time; cancel-after-completion does nothing.
    pub fn cancel_download(&self, item_id: &str) -> bool {
        if let Some((_, token)) = self.active.remove(item_id) {
            token.cancel();
            self.progress.remove(item_id);
            self.any_downloading_tx.send_replace(!self.active.is_empty());
            info!("Cancel requested for {}", item_id);
            true
        } else {
            debug!("No active download to cancel for {}", item_id);
            false
        }
    }

    /// Delete an item's download: cancels any active operation, removes
    /// the content record, and purges the item's directory.
    pub async fn delete_download(&self, item_id: &str) -> Result<()> {
        self.cancel_download(item_id);
        self.content_store.delete(item_id).await?;

        let item_dir = self.download_root.join(item_id);
        match tokio::fs::remove_dir_all(&item_dir).await {
            Ok(()) => info!("Deleted download files for {}", item_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", item_dir.display(), e),
        }
        Ok(())
    }

    /// Whether an item is currently queued or running.
    #[must_use]
    pub fn is_downloading(&self, item_id: &str) -> bool {
        self.active.contains_key(item_id)
    }

    /// Live download fraction for an item, if one is downloading.
    #[must_use]
    pub fn progress_fraction(&self, item_id: &str) -> Option<f64> {
        self.progress.get(item_id).map(|entry| *entry.value())
    }

    /// Snapshot of the live `item_id -> fraction` mapping.
    #[must_use]
    pub fn progress_snapshot(&self) -> HashMap<String, f64> {
        self.progress
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Derived download state for an item.
    pub async fn download_state(&self, item_id: &str) -> DownloadState {
        if let Some(fraction) = self.progress_fraction(item_id) {
            return DownloadState::Downloading { fraction };
        }
        match self.content_store.get(item_id).await {
            Some(record) if record.is_fully_downloaded() => DownloadState::Downloaded,
            _ => DownloadState::NotDownloaded,
        }
    }

    /// Subscribe to the aggregate "is anything downloading" signal.
    #[must_use]
    pub fn observe_any_downloading(&self) -> watch::Receiver<bool> {
        self.any_downloading_tx.subscribe()
    }

    /// Take the download event receiver. There is a single receiver;
    /// subsequent calls return `None`.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<DownloadEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Re-attach to a background transfer that survived a process
    /// restart, invoked once per surviving transfer at startup.
    ///
    /// A transfer matching a known, not-fully-downloaded content record
    /// is re-enqueued (already-resident tracks are skipped by the
    /// operation); anything else is invalidated and discarded.
    pub async fn reconnect(&self, transfer_identifier: &str) -> Result<bool> {
        let Some(item_id) = transfer_identifier.strip_prefix(TRANSFER_ID_PREFIX) else {
            warn!(
                "Unrecognized transfer identifier {}, discarding",
                transfer_identifier
            );
            return Ok(false);
        };
        let Some(record) = self.content_store.get(item_id).await else {
            warn!(
                "No content record for surviving transfer {}, invalidating",
                transfer_identifier
            );
            return Ok(false);
        };
        if record.is_fully_downloaded() {
            debug!("Transfer {} already complete, discarding", transfer_identifier);
            return Ok(false);
        }
        match self.active.entry(item_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(CancellationToken::new());
            }
        }

        self.enqueue(item_id);
        info!("Reconnected transfer for {}", item_id);
        Ok(true)
    }

    /// Sweep the download root for per-item directories that have no
    /// content record. Intended for startup; [`Self::new`] already runs
    /// it before the queue accepts work.
    pub async fn cleanup_orphaned_downloads(&self) -> Result<usize> {
        cleanup_orphans(&self.download_root, &self.content_store).await
    }

    /// Clone of the event sender, for collaborators that emit into the
    /// same stream.
    #[must_use]
    pub fn event_sender(&self) -> mpsc::UnboundedSender<DownloadEvent> {
        self.event_tx.clone()
    }

    fn enqueue(&self, item_id: &str) {
        self.progress.insert(item_id.to_string(), 0.0);
        self.any_downloading_tx.send_replace(true);
        let _ = self.event_tx.send(DownloadEvent::Queued {
            item_id: item_id.to_string(),
        });
        let _ = self.queue_tx.send(item_id.to_string());
    }
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("download_root", &self.download_root)
            .finish_non_exhaustive()
    }
}

/// Single worker draining the FIFO queue, one operation at a time.
fn spawn_worker(
    ctx: DownloadContext,
    mut queue_rx: mpsc::UnboundedReceiver<String>,
    active: Arc<DashMap<String, CancellationToken>>,
    any_downloading_tx: watch::Sender<bool>,
) {
    tokio::spawn(async move {
        while let Some(item_id) = queue_rx.recv().await {
            let token = active.get(&item_id).map(|entry| entry.value().clone());
            let Some(token) = token else {
                // Cancelled while still queued; it never ran.
                let _ = ctx.events.send(DownloadEvent::Cancelled {
                    item_id: item_id.clone(),
                });
                any_downloading_tx.send_replace(!active.is_empty());
                continue;
            };

            let operation = DownloadOperation::new(item_id.clone(), token);
            let status = operation.run(&ctx).await;
            debug!("Operation for {} finished: {}", item_id, status);

            active.remove(&item_id);
            ctx.progress.remove(&item_id);
            any_downloading_tx.send_replace(!active.is_empty());
        }
        debug!("Download worker stopped");
    });
}

async fn cleanup_orphans(root: &Path, store: &ContentStore) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let known: HashSet<String> = store
        .all()
        .await
        .into_iter()
        .map(|record| record.item_id)
        .collect();

    let mut removed = 0;
    for entry in walkdir::WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::local_storage(root, e))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if known.contains(&name) {
            continue;
        }
        warn!(
            "Removing orphaned download directory {}",
            entry.path().display()
        );
        tokio::fs::remove_dir_all(entry.path())
            .await
            .map_err(|e| Error::local_storage(entry.path(), e))?;
        removed += 1;
    }
    if removed > 0 {
        info!("Removed {} orphaned download directories", removed);
    }
    Ok(removed)
}
