//! `Earmark` Engine Library
//!
//! This crate provides the offline engine for the `Earmark` audiobook
//! application:
//! - Persisted content records with remote-metadata merge rules
//! - Persisted playback progress records
//! - Track downloads over a concurrency-1 FIFO queue, with cancellation,
//!   restart recovery, and orphaned-file cleanup
//! - Playback progress synchronization with the media server, debounced
//!   by a flush hysteresis and resilient to expired sessions
//! - Engine configuration management
//!
//! # Error Handling
//!
//! This crate uses one typed error for the whole engine. See the
//! [`error`] module for details.
//!
//! ```rust,ignore
//! use earmark_engine::{Error, Result};
//!
//! fn do_something() -> Result<()> {
//!     // Your code here
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod content_store;
pub mod download;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod progress_store;
pub mod progress_sync;
pub mod remote;

pub use config::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_FLUSH_TICK_SECS, DEFAULT_MIN_SECS_BETWEEN_FLUSHES,
    DEFAULT_MIN_UNSYNCED_SECS, DEFAULT_SESSION_TTL_HOURS, DEFAULT_SYNC_TIMEOUT_SECS,
    DEFAULT_TRACK_BYTES, DEFAULT_TRANSFER_TIMEOUT_SECS, EngineConfig, default_data_dir,
    default_download_root,
};
pub use content_store::{CONTENT_STORE_FILE, ContentStore};
pub use download::{DownloadEvent, OperationStatus};
pub use error::{Error, Result};
pub use model::{
    Chapter, ContentRecord, DownloadState, ProgressRecord, RemoteProgress, Track,
};
pub use orchestrator::{DownloadOrchestrator, TRANSFER_ID_PREFIX, transfer_id};
pub use progress_store::{PROGRESS_STORE_FILE, ProgressStore};
pub use progress_sync::ProgressSynchronizer;
pub use remote::{
    HttpTrackTransport, ProgressFeed, ProgressFn, RemoteSession, SessionNegotiator, TrackTransport,
};
