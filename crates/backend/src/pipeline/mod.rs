//! Queue-driven pipeline workers
//!
//! ```text
//! detect queue → Extractor → extract queue → Enricher → persistence
//!                    ↘                          ↘
//!                     dead-letter queue ←────────
//! ```
//!
//! Workers never talk to each other; every hand-off goes through the shared
//! [`QueueStore`](crate::queue::QueueStore). A failed task becomes a
//! [`DeadLetterRecord`](crate::domain::event::DeadLetterRecord) and the worker
//! moves on. Only a queue/store failure ends a worker.

mod dead_letter;
mod enricher;
mod extractor;
mod supervisor;
mod worker;


use std::{ops::AddAssign, time::Duration};

use serde::Serialize;

pub use self::{
  dead_letter::{DeadLetterEntry, DeadLetters, ReplayError, ReplaySummary},
  enricher::{EnrichError, Enricher},
  extractor::{ExtractError, Extractor},
  supervisor::{Pipeline, PipelineReport, StageReport},
};
use crate::domain::config::QueueConfig;

/// Queues a single worker reads from and writes to
#[derive(Debug, Clone)]
pub struct StageQueues {
  pub input: String,
  /// Next stage's queue, `None` for the last stage
  pub output: Option<String>,
  pub dead_letter: String,
  pub pop_timeout: Duration,
}

impl StageQueues {
  pub fn extractor(config: &QueueConfig) -> Self {
    Self {
      input: config.detect.clone(),
      output: Some(config.extract.clone()),
      dead_letter: config.dead_letter.clone(),
      pop_timeout: config.pop_timeout(),
    }
  }

  pub fn enricher(config: &QueueConfig) -> Self {
    Self {
      input: config.extract.clone(),
      output: None,
      dead_letter: config.dead_letter.clone(),
      pop_timeout: config.pop_timeout(),
    }
  }

  /// Shorter pop timeout, mostly for tests and one-shot runs
  pub fn with_pop_timeout(mut self, pop_timeout: Duration) -> Self {
    self.pop_timeout = pop_timeout;
    self
  }
}

/// Per-worker counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
  /// Payloads popped from the input queue
  pub received: u64,
  /// Tasks completed and forwarded (or persisted)
  pub processed: u64,
  pub dead_lettered: u64,
}

impl AddAssign for WorkerStats {
  fn add_assign(&mut self, other: Self) {
    self.received += other.received;
    self.processed += other.processed;
    self.dead_lettered += other.dead_lettered;
  }
}
