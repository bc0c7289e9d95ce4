//! Engine configuration with persistence to a JSON file.
//!
//! Holds the tunables for downloads and progress sync: directory
//! locations, flush hysteresis thresholds, and network timeouts.
//! Loaded from the platform config location with sensible defaults when
//! no file exists.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Minimum unsynced listening time (seconds) before a flush is considered.
pub const DEFAULT_MIN_UNSYNCED_SECS: f64 = 20.0;

/// Minimum seconds between two flush attempts for the same item.
pub const DEFAULT_MIN_SECS_BETWEEN_FLUSHES: u64 = 10;

/// How often the periodic flush check runs, in seconds.
pub const DEFAULT_FLUSH_TICK_SECS: u64 = 10;

/// Per-request connect timeout for downloads, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Overall transfer timeout for a single track download, in seconds.
/// Downloads may run for hours on slow networks.
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Timeout for progress sync flushes, in seconds. Failure is expected
/// and recoverable; a slow sync must never block playback.
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 5;

/// How long a remote session stays valid, in hours, unless every track
/// already has a resident local file.
pub const DEFAULT_SESSION_TTL_HOURS: u64 = 24;

/// Byte size assumed for a track whose size the server did not report.
/// Keeps progress math away from division by zero.
pub const DEFAULT_TRACK_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration for the offline engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Root directory for downloaded track files (one subdirectory per
    /// item). If not set, uses the default platform-specific location.
    #[serde(default)]
    pub download_root: Option<PathBuf>,

    /// Directory for the persisted store documents.
    /// If not set, uses the default platform-specific location.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Minimum unsynced listening time (seconds) before flushing.
    #[serde(default = "default_min_unsynced")]
    pub min_unsynced_secs: f64,

    /// Minimum seconds between flush attempts for one item.
    #[serde(default = "default_min_between_flushes")]
    pub min_secs_between_flushes: u64,

    /// Interval of the periodic flush check, in seconds.
    #[serde(default = "default_flush_tick")]
    pub flush_tick_secs: u64,

    /// Per-request connect timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Overall timeout for a single track transfer, in seconds.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Timeout for a progress sync flush, in seconds.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Remote session time-to-live, in hours.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_hours: u64,

    /// Fallback byte size for tracks with unknown size.
    #[serde(default = "default_track_bytes")]
    pub default_track_bytes: u64,
}

const fn default_min_unsynced() -> f64 {
    DEFAULT_MIN_UNSYNCED_SECS
}

const fn default_min_between_flushes() -> u64 {
    DEFAULT_MIN_SECS_BETWEEN_FLUSHES
}

const fn default_flush_tick() -> u64 {
    DEFAULT_FLUSH_TICK_SECS
}

const fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

const fn default_transfer_timeout() -> u64 {
    DEFAULT_TRANSFER_TIMEOUT_SECS
}

const fn default_sync_timeout() -> u64 {
    DEFAULT_SYNC_TIMEOUT_SECS
}

const fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_HOURS
}

const fn default_track_bytes() -> u64 {
    DEFAULT_TRACK_BYTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_root: None,
            data_dir: None,
            min_unsynced_secs: DEFAULT_MIN_UNSYNCED_SECS,
            min_secs_between_flushes: DEFAULT_MIN_SECS_BETWEEN_FLUSHES,
            flush_tick_secs: DEFAULT_FLUSH_TICK_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            default_track_bytes: DEFAULT_TRACK_BYTES,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download root directory.
    #[must_use]
    pub fn with_download_root(mut self, path: PathBuf) -> Self {
        self.download_root = Some(path);
        self
    }

    /// Set the data directory for persisted stores.
    #[must_use]
    pub fn with_data_dir(mut self, path: PathBuf) -> Self {
        self.data_dir = Some(path);
        self
    }

    /// Set the flush hysteresis thresholds.
    #[must_use]
    pub const fn with_flush_thresholds(
        mut self,
        min_unsynced_secs: f64,
        min_secs_between_flushes: u64,
    ) -> Self {
        self.min_unsynced_secs = min_unsynced_secs;
        self.min_secs_between_flushes = min_secs_between_flushes;
        self
    }

    /// Clamp nonsensical values back into a working range.
    pub fn validate(&mut self) {
        if self.min_unsynced_secs <= 0.0 {
            self.min_unsynced_secs = DEFAULT_MIN_UNSYNCED_SECS;
        }
        if self.flush_tick_secs == 0 {
            self.flush_tick_secs = DEFAULT_FLUSH_TICK_SECS;
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = DEFAULT_CONNECT_TIMEOUT_SECS;
        }
        if self.transfer_timeout_secs == 0 {
            self.transfer_timeout_secs = DEFAULT_TRANSFER_TIMEOUT_SECS;
        }
        if self.sync_timeout_secs == 0 {
            self.sync_timeout_secs = DEFAULT_SYNC_TIMEOUT_SECS;
        }
        if self.session_ttl_hours == 0 {
            self.session_ttl_hours = DEFAULT_SESSION_TTL_HOURS;
        }
        if self.default_track_bytes == 0 {
            self.default_track_bytes = DEFAULT_TRACK_BYTES;
        }
    }

    /// Resolved download root directory.
    #[must_use]
    pub fn resolved_download_root(&self) -> PathBuf {
        self.download_root
            .clone()
            .unwrap_or_else(default_download_root)
    }

    /// Resolved data directory for persisted stores.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Transfer timeout as a [`Duration`].
    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Sync flush timeout as a [`Duration`].
    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Minimum gap between flush attempts as a [`Duration`].
    #[must_use]
    pub const fn min_between_flushes(&self) -> Duration {
        Duration::from_secs(self.min_secs_between_flushes)
    }

    /// Load configuration from disk, or create defaults if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        if !config_path.exists() {
            debug!("Engine config not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save() {
                warn!("Failed to save default engine config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| Error::local_storage(&config_path, e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse engine config: {e}")))?;
        config.validate();

        info!("Loaded engine config from {}", config_path.display());
        Ok(config)
    }

    /// Save configuration to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        let config_path = config_file_path();

        if let Some(parent) = config_path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| Error::local_storage(parent, e))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, content).map_err(|e| Error::local_storage(&config_path, e))?;

        info!("Saved engine config to {}", config_path.display());
        Ok(())
    }
}

/// Default platform-specific download root.
#[must_use]
pub fn default_download_root() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("earmark").join("downloads"),
        |d| d.join("earmark").join("downloads"),
    )
}

/// Default platform-specific data directory for the store documents.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("earmark").join("data"),
        |d| d.join("earmark").join("data"),
    )
}

/// Path of the engine config file.
fn config_file_path() -> PathBuf {
    dirs::config_dir().map_or_else(
        || PathBuf::from("earmark").join("engine.json"),
        |d| d.join("earmark").join("engine.json"),
    )
}
