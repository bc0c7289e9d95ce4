//! Collaborator seams toward the media server.
//!
//! The engine does not own the server API models; it consumes three
//! narrow interfaces:
//! - [`SessionNegotiator`] - opens, syncs, and closes playback sessions;
//! - [`ProgressFeed`] - bulk fetch of the server's progress view;
//! - [`TrackTransport`] - moves one track's bytes to a local file with
//!   progress callbacks and cancellation.
//!
//! [`HttpTrackTransport`] is the production transport: a streaming GET
//! with a short connect timeout and a long transfer timeout, since a
//! download may legitimately run for hours on a slow network.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{Chapter, ContentRecord, RemoteProgress, Track};

/// Callback invoked with the cumulative bytes written for the current
/// transfer. Called at the transport's natural granularity; consumers
/// must tolerate high-frequency updates.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// A playback/download session issued by the server for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSession {
    /// Server-issued session identifier.
    pub session_id: String,
    /// Item title.
    pub title: String,
    /// Item author.
    pub author: String,
    /// Locator for the cover image, if any.
    pub cover_locator: Option<String>,
    /// Tracks of the item, with remote locators valid for this session.
    pub tracks: Vec<Track>,
    /// Chapter markers.
    pub chapters: Vec<Chapter>,
    /// Total item duration in seconds.
    pub total_duration_secs: f64,
}

impl RemoteSession {
    /// Seed a content record from this session.
    ///
    /// The expiry applies only while tracks reference remote streams;
    /// the merge rules keep already-downloaded files in place.
    #[must_use]
    pub fn into_record(self, item_id: &str, expiry: Option<DateTime<Utc>>) -> ContentRecord {
        ContentRecord {
            item_id: item_id.to_string(),
            title: self.title,
            author: self.author,
            cover_locator: self.cover_locator,
            tracks: self.tracks,
            chapters: self.chapters,
            session_id: Some(self.session_id),
            session_expiry: expiry,
        }
    }
}

/// Negotiates playback sessions with the server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    /// Open a session for an item, returning fresh metadata and track
    /// locators.
    async fn start_session(&self, item_id: &str) -> Result<RemoteSession>;

    /// Push accumulated listening time and the current position to a
    /// session. Fails with [`Error::InvalidSession`] when the session is
    /// no longer valid on the server.
    async fn sync_session(
        &self,
        session_id: &str,
        listened_secs: f64,
        position_secs: f64,
    ) -> Result<()>;

    /// Close a session.
    async fn close_session(&self, session_id: &str) -> Result<()>;
}

/// Bulk fetch of the server's view of playback progress.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProgressFeed: Send + Sync {
    /// Fetch the server's progress records for every item.
    async fn fetch_all_progress(&self) -> Result<Vec<RemoteProgress>>;
}

/// Moves one track's bytes from a remote locator to a local file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackTransport: Send + Sync {
    /// Transfer `locator` into `dest`, reporting cumulative bytes
    /// written through `on_bytes` and aborting when `cancel` fires.
    ///
    /// Returns the total number of bytes written.
    async fn transfer(
        &self,
        locator: &str,
        dest: &Path,
        on_bytes: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<u64>;
}

/// Production transport: streaming HTTP GET via `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTrackTransport {
    client: reqwest::Client,
}

impl HttpTrackTransport {
    /// Build a transport with the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.transfer_timeout())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TrackTransport for HttpTrackTransport {
    async fn transfer(
        &self,
        locator: &str,
        dest: &Path,
        on_bytes: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<u64> {
        debug!("Transferring {} -> {}", locator, dest.display());
        let response = self.client.get(locator).send().await?;
        if !response.status().is_success() {
            return Err(Error::TransientNetwork(format!(
                "unexpected status {} fetching {locator}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::local_storage(dest, e))?;
        let mut written: u64 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes)
                            .await
                            .map_err(|e| Error::local_storage(dest, e))?;
                        written += bytes.len() as u64;
                        on_bytes(written);
                    }
                    Some(Err(e)) => return Err(Error::TransientNetwork(e.to_string())),
                    None => break,
                },
            }
        }

        file.flush()
            .await
            .map_err(|e| Error::local_storage(dest, e))?;
        debug!("Transferred {} bytes from {}", written, locator);
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_session_into_record_seeds_fields() {
        let session = RemoteSession {
            session_id: "sess-1".to_string(),
            title: "A Book".to_string(),
            author: "An Author".to_string(),
            cover_locator: None,
            tracks: Vec::new(),
            chapters: Vec::new(),
            total_duration_secs: 300.0,
        };
        let expiry = Utc::now();
        let record = session.into_record("book-1", Some(expiry));
        assert_eq!(record.item_id, "book-1");
        assert_eq!(record.session_id.as_deref(), Some("sess-1"));
        assert_eq!(record.session_expiry, Some(expiry));
    }

    #[tokio::test]
    async fn test_mock_negotiator_invalid_session() {
        let mut negotiator = MockSessionNegotiator::new();
        negotiator
            .expect_sync_session()
            .returning(|_, _, _| Err(Error::InvalidSession("expired".to_string())));

        let err = negotiator
            .sync_session("sess-1", 25.0, 100.0)
            .await
            .expect_err("should fail");
        assert!(err.is_invalid_session());
    }
}
