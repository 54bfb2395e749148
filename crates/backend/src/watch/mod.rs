//! File watch service - turns filesystem churn into Detection events
//!
//! Two feeds converge on the same per-path processing:
//!
//! 1. Live notifications from a `notify` watcher (native, or polling for
//!    network and cloud-synced folders), forwarded into a
//!    [`CoalescingScheduler`] that collapses write bursts into one callback.
//! 2. Periodic reconciliation: a full `walkdir` scan at start and every
//!    `reconcile_interval`, which catches anything the watcher missed.
//!
//! Per path the service waits for the signature to hold still across the
//! stability window, re-checks that the file still wins its candidate group,
//! claims the dedup key on the shared store and finally pushes a
//! [`DetectionEvent`](crate::domain::event::DetectionEvent) onto the detect queue.
//!
//! # Failure model
//!
//! Stat/read errors are transient: the path is simply retried by the next
//! notification or reconciliation. Store errors are hard errors and surface
//! to the caller.

mod reconcile;
mod scheduler;
mod service;


use std::path::PathBuf;

pub use reconcile::ReconcileReport;
pub use scheduler::{CoalescingScheduler, ERROR_LOG_INTERVAL, SchedulerHandle};
pub use service::{FileWatchService, PathOutcome, WatchStats};

use crate::queue::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch path: {0}")]
  Watch(#[source] notify::Error),

  #[error("I/O error on {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error("Background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl WatchError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    WatchError::Io {
      path: path.into(),
      source,
    }
  }
}
