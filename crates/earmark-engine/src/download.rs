//! Download operation: executes one item's download end to end.
//!
//! One operation per item. Tracks are fetched strictly in index order
//! (a simplicity choice, not a correctness requirement): each track is
//! transferred to a `.part` file inside the item's directory, then
//! atomically renamed into place, and the content record's local path
//! is updated only after the rename. Progress is a single 0-1 fraction
//! weighted by expected track byte sizes, republished on every byte
//! callback from the transport.
//!
//! Failure semantics: a failing track discards its own partial file but
//! earlier completed tracks are kept, so a partially-downloaded item
//! stays partially downloaded. Cancellation discards the entire item
//! directory and clears the record's track paths; neither partial data
//! nor a path to a deleted file survives a cancel.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::content_store::ContentStore;
use crate::error::Error;
use crate::model::Track;
use crate::remote::{ProgressFn, TrackTransport};

/// Suffix of in-flight transfer files inside an item directory.
const PART_SUFFIX: &str = ".part";

/// Status of a download operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Queued, not yet running.
    Pending,
    /// Actively transferring tracks.
    Running,
    /// Every track transferred and recorded.
    Completed,
    /// An unrecoverable transfer or storage error occurred.
    Failed,
    /// Cancelled by request. A normal terminal state.
    Cancelled,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Event types emitted while downloads run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
    /// An item was accepted into the download queue.
    Queued {
        /// The item id.
        item_id: String,
    },
    /// An item's operation entered the running state.
    Started {
        /// The item id.
        item_id: String,
    },
    /// An item's download fraction changed.
    Progress {
        /// The item id.
        item_id: String,
        /// Completion fraction (0.0 - 1.0).
        fraction: f64,
    },
    /// An item finished downloading; all tracks are resident.
    Completed {
        /// The item id.
        item_id: String,
    },
    /// An item's download failed.
    Failed {
        /// The item id.
        item_id: String,
        /// Error message.
        error: String,
    },
    /// An item's download was cancelled.
    Cancelled {
        /// The item id.
        item_id: String,
    },
}

/// Shared dependencies a download operation runs against.
pub(crate) struct DownloadContext {
    /// Content record store; local paths land here per completed track.
    pub store: Arc<ContentStore>,
    /// Byte transport.
    pub transport: Arc<dyn TrackTransport>,
    /// Root directory; each item owns `<root>/<item_id>/`.
    pub download_root: PathBuf,
    /// Fallback byte size for tracks with unknown size.
    pub default_track_bytes: u64,
    /// Event sink.
    pub events: mpsc::UnboundedSender<DownloadEvent>,
    /// Live `item_id -> fraction` table shared with the orchestrator.
    pub progress: Arc<DashMap<String, f64>>,
}

/// Executes one item's download.
pub(crate) struct DownloadOperation {
    item_id: String,
    cancel: CancellationToken,
}

impl DownloadOperation {
    pub(crate) const fn new(item_id: String, cancel: CancellationToken) -> Self {
        Self { item_id, cancel }
    }

    /// Run the operation to a terminal state. Errors are translated into
    /// the terminal state and logged; the orchestrator only observes
    /// state transitions.
    pub(crate) async fn run(&self, ctx: &DownloadContext) -> OperationStatus {
        let _ = ctx.events.send(DownloadEvent::Started {
            item_id: self.item_id.clone(),
        });
        info!("Download running for {}", self.item_id);

        match self.run_inner(ctx).await {
            Ok(()) => {
                info!("Download completed for {}", self.item_id);
                let _ = ctx.events.send(DownloadEvent::Completed {
                    item_id: self.item_id.clone(),
                });
                OperationStatus::Completed
            }
            Err(Error::Cancelled) => {
                self.discard_item_dir(ctx).await;
                // The directory is gone, including tracks completed by
                // an earlier run; the record must not keep pointing at
                // deleted files.
                if let Err(e) = ctx.store.clear_track_paths(&self.item_id).await {
                    warn!("Failed to clear track paths for {}: {}", self.item_id, e);
                }
                info!("Download cancelled for {}", self.item_id);
                let _ = ctx.events.send(DownloadEvent::Cancelled {
                    item_id: self.item_id.clone(),
                });
                OperationStatus::Cancelled
            }
            Err(e) => {
                error!("Download failed for {}: {}", self.item_id, e);
                let _ = ctx.events.send(DownloadEvent::Failed {
                    item_id: self.item_id.clone(),
                    error: e.to_string(),
                });
                OperationStatus::Failed
            }
        }
    }

    async fn run_inner(&self, ctx: &DownloadContext) -> crate::error::Result<()> {
        let Some(record) = ctx.store.get(&self.item_id).await else {
            return Err(Error::RecordNotFound(self.item_id.clone()));
        };

        let mut tracks = record.tracks;
        tracks.sort_by_key(|t| t.index);

        let total_bytes: u64 = tracks
            .iter()
            .map(|t| expected_bytes(t, ctx.default_track_bytes))
            .sum::<u64>()
            .max(1);

        let item_dir = ctx.download_root.join(&self.item_id);
        tokio::fs::create_dir_all(&item_dir)
            .await
            .map_err(|e| Error::local_storage(&item_dir, e))?;

        let mut prior_bytes: u64 = 0;
        for track in tracks {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let expected = expected_bytes(&track, ctx.default_track_bytes);

            // Already-resident tracks (reconnect after a restart, or a
            // partially-downloaded item being retried) are skipped.
            if let Some(path) = &track.local_path
                && tokio::fs::try_exists(path).await.unwrap_or(false)
            {
                debug!(
                    "Track {} of {} already resident, skipping",
                    track.index, self.item_id
                );
                prior_bytes += expected;
                self.report_fraction(ctx, prior_bytes, 0, total_bytes);
                continue;
            }

            let final_path = item_dir.join(format!(
                "{}.{}",
                track.index,
                locator_extension(&track.remote_locator)
            ));
            let part_path = item_dir.join(format!(
                "{}{}",
                final_path
                    .file_name()
                    .map_or_else(|| track.index.to_string(), |n| n.to_string_lossy().into_owned()),
                PART_SUFFIX
            ));

            let on_bytes = self.progress_callback(ctx, prior_bytes, total_bytes);
            let transferred = ctx
                .transport
                .transfer(
                    &track.remote_locator,
                    &part_path,
                    on_bytes,
                    self.cancel.clone(),
                )
                .await;

            match transferred {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
                        // The failing track leaves no partial data
                        // behind, whichever step broke.
                        remove_part_file(&part_path).await;
                        return Err(Error::local_storage(&final_path, e));
                    }
                    debug!(
                        "Track {} of {} complete ({} bytes)",
                        track.index, self.item_id, bytes
                    );

                    // Record the local path only after the atomic move, so a
                    // crash between transfer and rename leaves no dangling
                    // reference. The store applies it under its own lock;
                    // concurrent record mutations are not clobbered.
                    ctx.store
                        .set_track_local_path(&self.item_id, track.index, final_path.clone())
                        .await?;
                    prior_bytes += expected;
                    self.report_fraction(ctx, prior_bytes, 0, total_bytes);
                }
                Err(e) => {
                    remove_part_file(&part_path).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Build the byte callback for one track, capturing how many bytes
    /// prior tracks already account for.
    fn progress_callback(
        &self,
        ctx: &DownloadContext,
        prior_bytes: u64,
        total_bytes: u64,
    ) -> ProgressFn {
        let item_id = self.item_id.clone();
        let progress = Arc::clone(&ctx.progress);
        let events = ctx.events.clone();
        Arc::new(move |written| {
            let fraction = ((prior_bytes + written) as f64 / total_bytes as f64).min(1.0);
            progress.insert(item_id.clone(), fraction);
            let _ = events.send(DownloadEvent::Progress {
                item_id: item_id.clone(),
                fraction,
            });
        })
    }

    fn report_fraction(
        &self,
        ctx: &DownloadContext,
        prior_bytes: u64,
        current_bytes: u64,
        total_bytes: u64,
    ) {
        let fraction = ((prior_bytes + current_bytes) as f64 / total_bytes as f64).min(1.0);
        ctx.progress.insert(self.item_id.clone(), fraction);
        let _ = ctx.events.send(DownloadEvent::Progress {
            item_id: self.item_id.clone(),
            fraction,
        });
    }

    /// Remove the whole item directory. Used on cancellation, where no
    /// partial data may remain resident.
    async fn discard_item_dir(&self, ctx: &DownloadContext) {
        let item_dir = ctx.download_root.join(&self.item_id);
        match tokio::fs::remove_dir_all(&item_dir).await {
            Ok(()) => debug!("Discarded {}", item_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard {}: {}", item_dir.display(), e),
        }
    }
}

/// Remove a `.part` file, tolerating its absence.
async fn remove_part_file(part_path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(part_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove partial file {}: {}", part_path.display(), e);
    }
}

/// Expected byte size of a track for progress weighting.
fn expected_bytes(track: &Track, default_track_bytes: u64) -> u64 {
    track.byte_size.unwrap_or(default_track_bytes)
}

/// Extract a file extension from a remote locator, falling back to
/// `bin` when the locator carries none.
fn locator_extension(locator: &str) -> String {
    let without_query = locator.split(['?', '#']).next().unwrap_or(locator);
    let name = without_query.rsplit('/').next().unwrap_or(without_query);
    match name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_extension() {
        assert_eq!(locator_extension("https://s/track/0.mp3"), "mp3");
        assert_eq!(locator_extension("https://s/track/0.M4B?token=abc"), "m4b");
        assert_eq!(locator_extension("https://s/track/0.flac#frag"), "flac");
        assert_eq!(locator_extension("https://s/stream/0"), "bin");
        assert_eq!(locator_extension("https://s/track/noext."), "bin");
        assert_eq!(locator_extension("https://s/track/0.not-an-ext!"), "bin");
    }

    #[test]
    fn test_expected_bytes_falls_back() {
        let track = Track {
            index: 0,
            duration_secs: 10.0,
            byte_size: None,
            remote_locator: "x".to_string(),
            local_path: None,
            last_modified: None,
        };
        assert_eq!(expected_bytes(&track, 42), 42);
    }

    #[test]
    fn test_operation_status_display() {
        assert_eq!(OperationStatus::Running.to_string(), "Running");
        assert_eq!(OperationStatus::Cancelled.to_string(), "Cancelled");
    }
}
