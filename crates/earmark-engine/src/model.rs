//! Data model for downloadable content and playback progress.
//!
//! Two independent aggregates share an item id as foreign key:
//! - [`ContentRecord`] describes what can be (or has been) downloaded:
//!   tracks, chapters, and locally-resident file paths.
//! - [`ProgressRecord`] describes how far the user has listened and how
//!   much listening time has not yet been pushed to the server.
//!
//! A progress record can exist without a content record (streaming-only
//! playback) and vice versa (a download that was never played).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audio segment of an item.
///
/// Indices are unique within an item and define playback order; the sum
/// of track durations is the item's total duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Position of this track within the item (unique per item).
    pub index: u32,
    /// Duration of this track in seconds.
    pub duration_secs: f64,
    /// Size of the track in bytes, when the server reports it.
    /// Used for progress weighting during downloads.
    #[serde(default)]
    pub byte_size: Option<u64>,
    /// How to fetch this track from the server.
    pub remote_locator: String,
    /// Local file path, present once the track has been downloaded.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Server-side modification timestamp, used as a merge tie-break.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Track {
    /// Whether this track has a locally-resident file.
    #[must_use]
    pub const fn is_resident(&self) -> bool {
        self.local_path.is_some()
    }
}

/// A chapter marker within an item. Navigation only; chapters are not
/// authoritative for the item's duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Chapter identifier.
    pub id: u64,
    /// Display title.
    pub title: String,
    /// Chapter start in seconds.
    pub start_secs: f64,
    /// Chapter end in seconds (`end > start`).
    pub end_secs: f64,
}

/// Persisted representation of one downloadable item.
///
/// Owned exclusively by the content store; mutated only through
/// [`ContentRecord::merge_from`] or deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Stable item identifier (store key).
    pub item_id: String,
    /// Item title.
    pub title: String,
    /// Item author.
    pub author: String,
    /// Locator for the cover image, if any.
    #[serde(default)]
    pub cover_locator: Option<String>,
    /// Tracks belonging to this item, ordered by index.
    pub tracks: Vec<Track>,
    /// Chapter markers.
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    /// Remote session currently associated with this item, if any.
    #[serde(default)]
    pub session_id: Option<String>,
    /// When the remote session expires. Sessions that reference only
    /// remote streams expire; fully-downloaded items never do.
    #[serde(default)]
    pub session_expiry: Option<DateTime<Utc>>,
}

impl ContentRecord {
    /// Whether every track has a locally-resident file.
    ///
    /// An item with no tracks is never considered downloaded.
    #[must_use]
    pub fn is_fully_downloaded(&self) -> bool {
        !self.tracks.is_empty() && self.tracks.iter().all(Track::is_resident)
    }

    /// Total duration of the item in seconds (sum of track durations).
    #[must_use]
    pub fn total_duration_secs(&self) -> f64 {
        self.tracks.iter().map(|t| t.duration_secs).sum()
    }

    /// Whether the remote session attached to this record has expired.
    ///
    /// Fully-downloaded items never expire; records with no recorded
    /// expiry are treated as still valid.
    #[must_use]
    pub fn is_session_expired(&self, now: DateTime<Utc>) -> bool {
        if self.is_fully_downloaded() {
            return false;
        }
        self.session_expiry.is_some_and(|expiry| now >= expiry)
    }

    /// Merge freshly-fetched remote metadata into this record.
    ///
    /// Scalar fields (title, author, cover, chapters, session id and
    /// expiry) are replaced wholesale by the incoming record. Tracks are
    /// merged per index:
    ///
    /// - no existing track at that index: take the incoming track;
    /// - the existing track's `last_modified` is greater or equal: keep
    ///   the existing track unchanged (it already reflects the latest
    ///   remote state and may carry a local file);
    /// - otherwise: take the incoming track's metadata but carry forward
    ///   the existing track's `local_path`, so a freshened remote track
    ///   never orphans an already-downloaded file.
    ///
    /// The merge is idempotent: applying the same incoming record twice
    /// yields the same result as applying it once.
    pub fn merge_from(&mut self, incoming: Self) {
        self.title = incoming.title;
        self.author = incoming.author;
        self.cover_locator = incoming.cover_locator;
        self.chapters = incoming.chapters;
        self.session_id = incoming.session_id;
        self.session_expiry = incoming.session_expiry;

        for track in incoming.tracks {
            match self.tracks.iter_mut().find(|t| t.index == track.index) {
                None => self.tracks.push(track),
                Some(existing) => {
                    // None compares below Some, so a track that never had a
                    // server timestamp yields to one that has.
                    if existing.last_modified >= track.last_modified {
                        continue;
                    }
                    let carried = existing.local_path.take();
                    *existing = track;
                    if existing.local_path.is_none() {
                        existing.local_path = carried;
                    }
                }
            }
        }
        self.tracks.sort_by_key(|t| t.index);
    }
}

/// Persisted per-item playback progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Stable item identifier (store key).
    pub item_id: String,
    /// Current position in seconds into the item.
    pub position_secs: f64,
    /// Listening time in seconds accumulated since the last successful
    /// remote flush.
    pub unsynced_listening_secs: f64,
    /// Total item duration in seconds.
    pub total_duration_secs: f64,
    /// Completion fraction (0.0 - 1.0), derived or server-confirmed.
    pub fraction: f64,
    /// Whether the item is marked finished.
    pub is_finished: bool,
    /// When the item was last played.
    pub last_played_at: DateTime<Utc>,
    /// Merge authority: records with a newer `last_update` win.
    pub last_update: DateTime<Utc>,
}

impl ProgressRecord {
    /// Create a fresh record for an item that has just started playing.
    #[must_use]
    pub fn new(item_id: impl Into<String>, total_duration_secs: f64) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.into(),
            position_secs: 0.0,
            unsynced_listening_secs: 0.0,
            total_duration_secs,
            fraction: 0.0,
            is_finished: false,
            last_played_at: now,
            last_update: now,
        }
    }

    /// Advance playback by `delta_secs` of listening time.
    ///
    /// Position and the unsynced counter both move; fraction is
    /// re-derived when the total duration is known.
    pub fn apply_listening_delta(&mut self, delta_secs: f64) {
        self.position_secs += delta_secs;
        if self.total_duration_secs > 0.0 {
            self.position_secs = self.position_secs.min(self.total_duration_secs);
            self.fraction = (self.position_secs / self.total_duration_secs).min(1.0);
        }
        self.unsynced_listening_secs += delta_secs;
        let now = Utc::now();
        self.last_played_at = now;
        self.last_update = now;
    }
}

/// The remote server's view of one item's progress, as returned by the
/// bulk progress feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProgress {
    /// Stable item identifier.
    pub item_id: String,
    /// Position in seconds.
    pub position_secs: f64,
    /// Total item duration in seconds.
    pub total_duration_secs: f64,
    /// Completion fraction (0.0 - 1.0).
    pub fraction: f64,
    /// Whether the server considers the item finished.
    pub is_finished: bool,
    /// When the server last saw an update for this item.
    pub last_update: DateTime<Utc>,
}

impl RemoteProgress {
    /// Convert into a local progress record (nothing unsynced yet).
    #[must_use]
    pub fn into_record(self) -> ProgressRecord {
        ProgressRecord {
            item_id: self.item_id,
            position_secs: self.position_secs,
            unsynced_listening_secs: 0.0,
            total_duration_secs: self.total_duration_secs,
            fraction: self.fraction,
            is_finished: self.is_finished,
            last_played_at: self.last_update,
            last_update: self.last_update,
        }
    }
}

/// Derived, ephemeral download state of an item.
///
/// Computed from whether an operation is active and whether every track
/// has a resident local file; never persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum DownloadState {
    /// No local files and no active operation.
    NotDownloaded,
    /// An operation is active for this item.
    Downloading {
        /// Completion fraction (0.0 - 1.0).
        fraction: f64,
    },
    /// Every track has a resident local file.
    Downloaded,
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDownloaded => write!(f, "Not downloaded"),
            Self::Downloading { fraction } => {
                write!(f, "Downloading ({:.0}%)", fraction * 100.0)
            }
            Self::Downloaded => write!(f, "Downloaded"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn track(index: u32, locator: &str) -> Track {
        Track {
            index,
            duration_secs: 100.0,
            byte_size: Some(1024),
            remote_locator: locator.to_string(),
            local_path: None,
            last_modified: None,
        }
    }

    fn record(item_id: &str, tracks: Vec<Track>) -> ContentRecord {
        ContentRecord {
            item_id: item_id.to_string(),
            title: "A Book".to_string(),
            author: "An Author".to_string(),
            cover_locator: None,
            tracks,
            chapters: Vec::new(),
            session_id: None,
            session_expiry: None,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_merge_replaces_scalars() {
        let mut existing = record("book-1", vec![track(0, "a")]);
        let mut incoming = record("book-1", vec![track(0, "a")]);
        incoming.title = "New Title".to_string();
        incoming.session_id = Some("sess-2".to_string());

        existing.merge_from(incoming);
        assert_eq!(existing.title, "New Title");
        assert_eq!(existing.session_id.as_deref(), Some("sess-2"));
    }

    #[test]
    fn test_merge_adds_unknown_tracks() {
        let mut existing = record("book-1", vec![track(0, "a")]);
        let incoming = record("book-1", vec![track(0, "a"), track(1, "b")]);

        existing.merge_from(incoming);
        assert_eq!(existing.tracks.len(), 2);
        assert_eq!(existing.tracks[1].index, 1);
    }

    #[test]
    fn test_merge_keeps_existing_when_not_older() {
        let mut old = track(0, "a");
        old.last_modified = Some(ts(200));
        old.local_path = Some(PathBuf::from("/files/0.mp3"));

        let mut fresh = track(0, "a-new");
        fresh.last_modified = Some(ts(100));

        let mut existing = record("book-1", vec![old]);
        existing.merge_from(record("book-1", vec![fresh]));

        // Existing track is newer, so it is untouched.
        assert_eq!(existing.tracks[0].remote_locator, "a");
        assert_eq!(
            existing.tracks[0].local_path.as_deref(),
            Some(std::path::Path::new("/files/0.mp3"))
        );
    }

    #[test]
    fn test_merge_carries_local_path_forward() {
        let mut old = track(0, "a");
        old.last_modified = Some(ts(100));
        old.local_path = Some(PathBuf::from("/files/0.mp3"));

        let mut fresh = track(0, "a-new");
        fresh.last_modified = Some(ts(200));

        let mut existing = record("book-1", vec![old]);
        existing.merge_from(record("book-1", vec![fresh]));

        // Incoming metadata wins, but the downloaded file is kept.
        assert_eq!(existing.tracks[0].remote_locator, "a-new");
        assert_eq!(
            existing.tracks[0].local_path.as_deref(),
            Some(std::path::Path::new("/files/0.mp3"))
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut old = track(0, "a");
        old.last_modified = Some(ts(100));
        old.local_path = Some(PathBuf::from("/files/0.mp3"));
        let mut existing = record("book-1", vec![old]);

        let mut fresh = track(0, "a-new");
        fresh.last_modified = Some(ts(200));
        let incoming = record("book-1", vec![fresh, track(1, "b")]);

        existing.merge_from(incoming.clone());
        let once = existing.clone();
        existing.merge_from(incoming);
        assert_eq!(existing, once);
    }

    #[test]
    fn test_fully_downloaded_requires_all_tracks() {
        let mut rec = record("book-1", vec![track(0, "a"), track(1, "b")]);
        assert!(!rec.is_fully_downloaded());

        rec.tracks[0].local_path = Some(PathBuf::from("/files/0.mp3"));
        assert!(!rec.is_fully_downloaded());

        rec.tracks[1].local_path = Some(PathBuf::from("/files/1.mp3"));
        assert!(rec.is_fully_downloaded());

        let empty = record("book-2", Vec::new());
        assert!(!empty.is_fully_downloaded());
    }

    #[test]
    fn test_session_expiry_ignored_when_fully_downloaded() {
        let mut rec = record("book-1", vec![track(0, "a")]);
        rec.session_expiry = Some(ts(100));
        assert!(rec.is_session_expired(ts(200)));

        rec.tracks[0].local_path = Some(PathBuf::from("/files/0.mp3"));
        assert!(!rec.is_session_expired(ts(200)));
    }

    #[test]
    fn test_listening_delta_clamps_to_duration() {
        let mut rec = ProgressRecord::new("book-1", 100.0);
        rec.apply_listening_delta(60.0);
        assert_eq!(rec.position_secs, 60.0);
        assert_eq!(rec.unsynced_listening_secs, 60.0);
        assert!((rec.fraction - 0.6).abs() < f64::EPSILON);

        rec.apply_listening_delta(60.0);
        assert_eq!(rec.position_secs, 100.0);
        assert_eq!(rec.fraction, 1.0);
        // The unsynced counter keeps counting regardless of clamping.
        assert_eq!(rec.unsynced_listening_secs, 120.0);
    }

    #[test]
    fn test_download_state_display() {
        assert_eq!(DownloadState::NotDownloaded.to_string(), "Not downloaded");
        assert_eq!(
            DownloadState::Downloading { fraction: 0.42 }.to_string(),
            "Downloading (42%)"
        );
        assert_eq!(DownloadState::Downloaded.to_string(), "Downloaded");
    }

    #[test]
    fn test_remote_progress_into_record() {
        let remote = RemoteProgress {
            item_id: "book-1".to_string(),
            position_secs: 50.0,
            total_duration_secs: 100.0,
            fraction: 0.5,
            is_finished: false,
            last_update: ts(1000),
        };
        let rec = remote.into_record();
        assert_eq!(rec.position_secs, 50.0);
        assert_eq!(rec.unsynced_listening_secs, 0.0);
        assert_eq!(rec.last_update, ts(1000));
    }
}
