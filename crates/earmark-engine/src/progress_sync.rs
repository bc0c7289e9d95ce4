//! Progress synchronizer: reconciles local listening time with the
//! remote session.
//!
//! Listening time accumulates locally on every playback delta report.
//! Flushing to the server is debounced with a two-part hysteresis: at
//! least 20 seconds of unsynced listening *and* at least 10 seconds
//! since the last flush attempt. This keeps short listening bursts off
//! the network while bounding data loss on abrupt termination to
//! roughly 20-30 seconds of listening.
//!
//! Flush failures are invisible to the user. A transient failure keeps
//! the counter and retries on the next opportunity; an invalid session
//! triggers one session recreation and a single retry before giving up
//! silently until the next tick. On item close a final flush runs
//! regardless of hysteresis, then the session is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::content_store::ContentStore;
use crate::error::{Error, Result};
use crate::model::ProgressRecord;
use crate::progress_store::ProgressStore;
use crate::remote::{ProgressFeed, SessionNegotiator};

/// Keeps local playback progress and the remote session in sync.
pub struct ProgressSynchronizer {
    progress_store: Arc<ProgressStore>,
    content_store: Arc<ContentStore>,
    negotiator: Arc<dyn SessionNegotiator>,
    feed: Arc<dyn ProgressFeed>,
    min_unsynced_secs: f64,
    min_between_flushes: Duration,
    flush_tick: Duration,
    sync_timeout: Duration,
    session_ttl_hours: u64,
    /// Last flush *attempt* per item, successful or not.
    last_attempt: DashMap<String, Instant>,
    /// Items with a flush currently in flight. At most one per item.
    in_flight: DashSet<String>,
    /// The item whose local state is authoritative while it plays.
    currently_playing: RwLock<Option<String>>,
}

impl ProgressSynchronizer {
    /// Build a synchronizer over the given stores and collaborators.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        progress_store: Arc<ProgressStore>,
        content_store: Arc<ContentStore>,
        negotiator: Arc<dyn SessionNegotiator>,
        feed: Arc<dyn ProgressFeed>,
    ) -> Self {
        Self {
            progress_store,
            content_store,
            negotiator,
            feed,
            min_unsynced_secs: config.min_unsynced_secs,
            min_between_flushes: config.min_between_flushes(),
            flush_tick: Duration::from_secs(config.flush_tick_secs),
            sync_timeout: config.sync_timeout(),
            session_ttl_hours: config.session_ttl_hours,
            last_attempt: DashMap::new(),
            in_flight: DashSet::new(),
            currently_playing: RwLock::new(None),
        }
    }

    /// Record `delta_secs` of listening time for an item, creating its
    /// progress record on first playback, then flush opportunistically.
    pub async fn report_playback_delta(&self, item_id: &str, delta_secs: f64) -> Result<()> {
        if delta_secs <= 0.0 {
            return Ok(());
        }
        let duration = self
            .content_store
            .get(item_id)
            .await
            .map_or(0.0, |record| record.total_duration_secs());
        let mut record = self.progress_store.get_or_create(item_id, duration).await?;
        if record.total_duration_secs <= 0.0 && duration > 0.0 {
            record.total_duration_secs = duration;
        }
        record.apply_listening_delta(delta_secs);
        debug!(
            "Playback delta for {}: +{:.1}s ({:.1}s unsynced)",
            item_id, delta_secs, record.unsynced_listening_secs
        );
        self.progress_store.save(record).await?;

        self.maybe_flush(item_id).await;
        Ok(())
    }

    /// Overwrite the stored position for an item. The position is
    /// advisory and continuously re-derived from the player, so this
    /// never touches the unsynced counter.
    pub async fn set_position(&self, item_id: &str, position_secs: f64) -> Result<()> {
        let Some(mut record) = self.progress_store.get(item_id).await else {
            return Ok(());
        };
        record.position_secs = position_secs.max(0.0);
        if record.total_duration_secs > 0.0 {
            record.position_secs = record.position_secs.min(record.total_duration_secs);
            record.fraction = (record.position_secs / record.total_duration_secs).min(1.0);
        }
        let now = Utc::now();
        record.last_played_at = now;
        record.last_update = now;
        self.progress_store.save(record).await
    }

    /// Set or clear the finished flag for an item.
    pub async fn mark_finished(&self, item_id: &str, is_finished: bool) -> Result<()> {
        self.progress_store.update_finished(item_id, is_finished).await
    }

    /// Track which item is actively playing. Remote merges skip it.
    pub async fn set_currently_playing(&self, item_id: Option<String>) {
        let mut playing = self.currently_playing.write().await;
        *playing = item_id;
    }

    /// Flush an item's progress if the hysteresis allows it. Errors are
    /// swallowed: sync degrades to "retry on the next opportunity".
    pub async fn maybe_flush(&self, item_id: &str) {
        let Some(record) = self.progress_store.get(item_id).await else {
            return;
        };
        let elapsed = self
            .last_attempt
            .get(item_id)
            .map(|entry| entry.value().elapsed());
        if !should_flush(
            record.unsynced_listening_secs,
            elapsed,
            self.min_unsynced_secs,
            self.min_between_flushes,
        ) {
            return;
        }
        if let Err(e) = self.flush(item_id).await {
            debug!("Progress flush for {} deferred: {}", item_id, e);
        }
    }

    /// Flush an item's progress now, ignoring the hysteresis.
    ///
    /// At most one flush per item is in flight; a concurrent call is a
    /// no-op. On an invalid session the synchronizer negotiates a new
    /// one, re-points the records at it, and retries once.
    pub async fn flush(&self, item_id: &str) -> Result<()> {
        if !self.in_flight.insert(item_id.to_string()) {
            debug!("Flush already in flight for {}", item_id);
            return Ok(());
        }
        let result = self.flush_guarded(item_id).await;
        self.in_flight.remove(item_id);
        result
    }

    /// Final flush for an item the user is leaving, then release its
    /// remote session.
    pub async fn close_session(&self, item_id: &str) -> Result<()> {
        if let Err(e) = self.flush(item_id).await {
            warn!("Final flush for {} failed: {}", item_id, e);
        }

        if let Some(session_id) = self.session_id_of(item_id).await {
            match tokio::time::timeout(self.sync_timeout, self.negotiator.close_session(&session_id))
                .await
            {
                Ok(Ok(())) => info!("Closed session {} for {}", session_id, item_id),
                Ok(Err(e)) => warn!("Failed to close session for {}: {}", item_id, e),
                Err(_) => warn!("Closing session for {} timed out", item_id),
            }
        }

        let mut playing = self.currently_playing.write().await;
        if playing.as_deref() == Some(item_id) {
            *playing = None;
        }
        Ok(())
    }

    /// Fetch the remote view of all progress and merge it locally,
    /// skipping the currently-playing item. Intended for app foreground
    /// and login. Returns the number of records applied.
    pub async fn sync_all_from_remote(&self) -> Result<usize> {
        let remote = self.feed.fetch_all_progress().await?;
        info!("Fetched {} remote progress records", remote.len());
        let playing = self.currently_playing.read().await.clone();
        self.progress_store
            .sync_from_remote(remote, playing.as_deref())
            .await
    }

    /// Spawn the periodic flush check. Runs until `cancel` fires.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sync.flush_tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for record in sync.progress_store.all().await {
                            if record.unsynced_listening_secs > 0.0 {
                                sync.maybe_flush(&record.item_id).await;
                            }
                        }
                    }
                }
            }
            debug!("Flush loop stopped");
        })
    }

    async fn flush_guarded(&self, item_id: &str) -> Result<()> {
        self.last_attempt.insert(item_id.to_string(), Instant::now());

        let Some(record) = self.progress_store.get(item_id).await else {
            return Ok(());
        };
        if record.unsynced_listening_secs <= 0.0 {
            return Ok(());
        }

        let session_id = match self.session_id_of(item_id).await {
            Some(id) => id,
            None => self.renew_session(item_id).await?,
        };

        match self.sync_once(&session_id, &record).await {
            Ok(()) => self.clear_unsynced(item_id).await,
            Err(e) if e.is_invalid_session() => {
                info!("Session for {} invalid, renewing and retrying", item_id);
                let new_id = self.renew_session(item_id).await?;
                self.sync_once(&new_id, &record).await?;
                self.clear_unsynced(item_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_once(&self, session_id: &str, record: &ProgressRecord) -> Result<()> {
        let call = self.negotiator.sync_session(
            session_id,
            record.unsynced_listening_secs,
            record.position_secs,
        );
        match tokio::time::timeout(self.sync_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientNetwork(format!(
                "sync timed out after {:?}",
                self.sync_timeout
            ))),
        }
    }

    /// Negotiate a new session and re-point the content record at it.
    async fn renew_session(&self, item_id: &str) -> Result<String> {
        let session = self.negotiator.start_session(item_id).await?;
        let session_id = session.session_id.clone();
        let expiry = Utc::now() + chrono::Duration::hours(self.session_ttl_hours as i64);
        self.content_store
            .merge_remote(session.into_record(item_id, Some(expiry)))
            .await?;
        debug!("New session {} for {}", session_id, item_id);
        Ok(session_id)
    }

    async fn clear_unsynced(&self, item_id: &str) -> Result<()> {
        if let Some(mut record) = self.progress_store.get(item_id).await {
            record.unsynced_listening_secs = 0.0;
            self.progress_store.save(record).await?;
        }
        Ok(())
    }

    async fn session_id_of(&self, item_id: &str) -> Option<String> {
        self.content_store
            .get(item_id)
            .await
            .and_then(|record| record.session_id)
    }
}

impl std::fmt::Debug for ProgressSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSynchronizer")
            .field("min_unsynced_secs", &self.min_unsynced_secs)
            .finish_non_exhaustive()
    }
}

/// The flush hysteresis: enough unsynced listening time *and* enough
/// time since the last attempt. An item with no prior attempt passes
/// the second check.
fn should_flush(
    unsynced_secs: f64,
    elapsed_since_last_attempt: Option<Duration>,
    min_unsynced_secs: f64,
    min_between: Duration,
) -> bool {
    if unsynced_secs < min_unsynced_secs {
        return false;
    }
    elapsed_since_last_attempt.is_none_or(|elapsed| elapsed >= min_between)
}
