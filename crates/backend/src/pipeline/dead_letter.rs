//! Dead-letter inspection and manual replay
//!
//! Failed tasks are never retried automatically. An operator peeks at the
//! dead-letter queue, fixes the cause and replays records back onto the
//! queue of the stage that gave up on them.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
  domain::{
    config::QueueConfig,
    event::{DeadLetterRecord, OriginalEvent, Task},
  },
  queue::{QueueError, QueueStore},
};

const DRAIN_POP_TIMEOUT: Duration = Duration::from_millis(10);

/// One item of the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeadLetterEntry {
  Record(DeadLetterRecord),
  /// Payload that is not a dead-letter record at all
  Malformed { payload: String },
}

impl DeadLetterEntry {
  fn parse(payload: &str) -> Self {
    match Task::decode(payload) {
      Ok(Task::DeadLetter(record)) => DeadLetterEntry::Record(record),
      _ => DeadLetterEntry::Malformed {
        payload: payload.to_string(),
      },
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
  #[error("Dead letter holds an undecodable payload and cannot be replayed")]
  NotReplayable,
  #[error(transparent)]
  Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
  pub replayed: usize,
  /// Entries put back on the dead-letter queue because they cannot be replayed
  pub kept: usize,
}

pub struct DeadLetters {
  store: Arc<dyn QueueStore>,
  queues: QueueConfig,
}

impl DeadLetters {
  pub fn new(store: Arc<dyn QueueStore>, queues: QueueConfig) -> Self {
    Self { store, queues }
  }

  pub async fn depth(&self) -> Result<usize, QueueError> {
    self.store.depth(&self.queues.dead_letter).await
  }

  /// Up to `limit` entries, oldest first, left on the queue
  pub async fn peek(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
    let payloads = self.store.peek(&self.queues.dead_letter, limit).await?;
    Ok(payloads.iter().map(|payload| DeadLetterEntry::parse(payload)).collect())
  }

  /// Remove up to `limit` entries, oldest first
  pub async fn drain(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
    let mut drained = Vec::new();
    while drained.len() < limit {
      match self.store.pop(&self.queues.dead_letter, DRAIN_POP_TIMEOUT).await? {
        Some(payload) => drained.push(DeadLetterEntry::parse(&payload)),
        None => break,
      }
    }
    Ok(drained)
  }

  /// Push the original event back onto the queue of the stage that failed it.
  ///
  /// Returns the queue it went to.
  pub async fn replay(&self, record: &DeadLetterRecord) -> Result<String, ReplayError> {
    let (queue, task) = match &record.original_event {
      OriginalEvent::Detection(event) => (&self.queues.detect, Task::Detection(event.clone())),
      OriginalEvent::Extraction(event) => (&self.queues.extract, Task::Extraction(event.clone())),
      OriginalEvent::Unparsed { .. } => return Err(ReplayError::NotReplayable),
    };

    self.store.push_task(queue, &task).await?;
    info!(stage = %record.stage, queue = %queue, kind = task.kind(), "Replayed dead letter");
    Ok(queue.clone())
  }

  /// Replay up to `limit` entries, one pop at a time.
  ///
  /// Entries that cannot be replayed go back on the dead-letter queue. On a
  /// store error the entry in hand is returned to the dead-letter queue before
  /// the error is; entries not yet popped stay where they are.
  pub async fn replay_all(&self, limit: usize) -> Result<ReplaySummary, QueueError> {
    let mut summary = ReplaySummary::default();
    // Kept entries are re-pushed at the tail; the depth bound visits each once
    let budget = limit.min(self.depth().await?);

    for _ in 0..budget {
      let Some(payload) = self.store.pop(&self.queues.dead_letter, DRAIN_POP_TIMEOUT).await? else {
        break;
      };

      let outcome = match DeadLetterEntry::parse(&payload) {
        DeadLetterEntry::Record(record) => self.replay(&record).await,
        DeadLetterEntry::Malformed { .. } => {
          warn!("Malformed entry on dead-letter queue, keeping it");
          Err(ReplayError::NotReplayable)
        }
      };

      match outcome {
        Ok(_) => summary.replayed += 1,
        Err(ReplayError::NotReplayable) => {
          self.store.push(&self.queues.dead_letter, payload).await?;
          summary.kept += 1;
        }
        Err(ReplayError::Queue(e)) => {
          if let Err(restore) = self.store.push(&self.queues.dead_letter, payload).await {
            error!(error = %restore, "Failed to return dead letter to its queue");
          }
          return Err(e);
        }
      }
    }

    Ok(summary)
  }
}
