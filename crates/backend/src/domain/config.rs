//! Configuration for the intake pipeline.
//!
//! Config priority: explicit path > user (~/.config/cvingest/config.toml) > defaults.
//! `CVINGEST_WATCH_ROOT` and `REDIS_URL` override whatever the file says.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

// ============================================================================
// Watch Configuration
// ============================================================================

/// Folder watching, debounce and reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
  /// Root of the shared CV folder tree
  pub root: PathBuf,

  /// File extensions to ingest, without the leading dot (default: pptx, txt)
  pub extensions: Vec<String>,

  /// Name prefixes of editor/lock temp files that are never ingested
  pub temp_prefixes: Vec<String>,

  /// Quiet period after the last change notification (default: 750)
  pub debounce_ms: u64,

  /// Delay between the two signature observations of the stability check (default: 1500)
  pub stable_ms: u64,

  /// Lifetime of a dedup marker in seconds (default: 86400)
  pub dedupe_ttl_secs: u64,

  /// Run a reconciliation scan at startup and on the interval below (default: true)
  pub reconcile: bool,

  /// Seconds between reconciliation scans, 0 disables the periodic loop (default: 600)
  pub reconcile_interval_secs: u64,

  /// Paths stabilized in parallel during a reconciliation pass (default: 8)
  pub reconcile_concurrency: usize,

  /// Use the polling backend instead of native notifications (default: false)
  /// Native events are unreliable on network mounts and some sync clients.
  pub poll: bool,

  /// Poll interval for the polling backend in seconds (default: 2)
  pub poll_interval_secs: u64,

  /// Upper bound for joining background tasks on stop (default: 5)
  pub shutdown_timeout_secs: u64,
}

impl Default for WatchConfig {
  fn default() -> Self {
    Self {
      root: PathBuf::from("data/inbox"),
      extensions: vec!["pptx".to_string(), "txt".to_string()],
      temp_prefixes: vec!["~$".to_string(), ".~lock.".to_string()],
      debounce_ms: 750,
      stable_ms: 1500,
      dedupe_ttl_secs: 24 * 60 * 60,
      reconcile: true,
      reconcile_interval_secs: 10 * 60,
      reconcile_concurrency: 8,
      poll: false,
      poll_interval_secs: 2,
      shutdown_timeout_secs: 5,
    }
  }
}

impl WatchConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn stable_window(&self) -> Duration {
    Duration::from_millis(self.stable_ms)
  }

  pub fn dedupe_ttl(&self) -> Duration {
    Duration::from_secs(self.dedupe_ttl_secs)
  }

  /// `None` when periodic reconciliation is disabled
  pub fn reconcile_interval(&self) -> Option<Duration> {
    (self.reconcile && self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs)
  }

  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout_secs)
  }
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Queue names on the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Detection events, consumed by extractors
  pub detect: String,
  /// Extraction events, consumed by enrichers
  pub extract: String,
  /// Dead-letter records from either stage
  pub dead_letter: String,
  /// Timed pop used by workers so they can notice shutdown (default: 5)
  pub pop_timeout_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      detect: "ingest:queue:extract".to_string(),
      extract: "ingest:queue:enrich".to_string(),
      dead_letter: "ingest:queue:dlq".to_string(),
      pop_timeout_secs: 5,
    }
  }
}

impl QueueConfig {
  pub fn pop_timeout(&self) -> Duration {
    Duration::from_secs(self.pop_timeout_secs)
  }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Extractor instances (default: CPU count, at most 4)
  pub extractors: usize,
  /// Enricher instances (default: 1, enrichment is bound by the LLM service)
  pub enrichers: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      extractors: num_cpus::get().clamp(1, 4),
      enrichers: 1,
    }
  }
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Queue/store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
  /// In-process queues, only useful for a single process
  #[default]
  Memory,
  /// Shared Redis instance
  Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub backend: StoreBackend,
  pub redis_url: String,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      backend: StoreBackend::Memory,
      redis_url: "redis://localhost:6379/0".to_string(),
    }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// off, error, warn, info, debug, trace (default: info)
  pub log_level: String,
  /// Write logs to files in this directory instead of the console
  #[serde(skip_serializing_if = "Option::is_none")]
  pub log_dir: Option<PathBuf>,
  /// hourly, daily or never (default: daily)
  pub log_rotation: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_dir: None,
      log_rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Root Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
  #[serde(default)]
  pub watch: WatchConfig,

  #[serde(default)]
  pub queues: QueueConfig,

  #[serde(default)]
  pub workers: WorkerConfig,

  #[serde(default)]
  pub store: StoreConfig,

  #[serde(default)]
  pub logging: LoggingConfig,
}

impl IngestConfig {
  /// Load config from an explicit path, the user config, or defaults
  ///
  /// A missing user config is not an error; an explicit path that cannot be
  /// read or parsed is.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match explicit {
      Some(path) => Self::from_file(path)?,
      None => match Self::user_config_path() {
        Some(path) if path.exists() => Self::from_file(&path)?,
        _ => Self::default(),
      },
    };

    config.apply_env_overrides();
    Ok(config)
  }

  /// Parse a TOML config file
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("cvingest").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("cvingest").join("config.toml"))
  }

  fn apply_env_overrides(&mut self) {
    if let Ok(root) = std::env::var("CVINGEST_WATCH_ROOT")
      && !root.is_empty()
    {
      self.watch.root = PathBuf::from(root);
    }

    if let Ok(url) = std::env::var("REDIS_URL")
      && !url.is_empty()
    {
      self.store.redis_url = url;
    }
  }
}
