//! Shared queue/store service
//!
//! Stages never talk to each other directly: every hand-off goes through
//! a named FIFO queue, and the duplicate-publish guard is a TTL key with
//! set-if-absent semantics. Both live behind [`QueueStore`] so that several
//! watcher and worker processes can share one view.
//!
//! Delivery is at-least-once and unordered; callers must tolerate both.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

pub use self::memory::MemoryQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;
use crate::domain::{
  config::{StoreBackend, StoreConfig},
  event::Task,
};

#[async_trait]
pub trait QueueStore: Send + Sync {
  fn name(&self) -> &str;

  /// Append a payload to the tail of a queue
  async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError>;

  /// Pop from the head of a queue, waiting up to `timeout` for one to arrive
  async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError>;

  /// Atomically create `key` unless it exists. Returns true if this call created it.
  async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, QueueError>;

  /// Remove `key` so the next `set_if_absent` on it succeeds again
  async fn release(&self, key: &str) -> Result<(), QueueError>;

  /// Number of payloads waiting in a queue
  async fn depth(&self, queue: &str) -> Result<usize, QueueError>;

  /// Up to `limit` payloads from the head of a queue, without removing them
  async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError>;

  /// Encode and push a typed task
  async fn push_task(&self, queue: &str, task: &Task) -> Result<(), QueueError> {
    let payload = task.encode()?;
    self.push(queue, payload).await
  }
}

impl dyn QueueStore {
  pub async fn from_config(config: &StoreConfig) -> Result<Arc<dyn QueueStore>, QueueError> {
    match config.backend {
      StoreBackend::Memory => Ok(Arc::new(MemoryQueueStore::new())),
      #[cfg(feature = "redis")]
      StoreBackend::Redis => {
        let store = RedisQueueStore::connect(&config.redis_url).await?;
        Ok(Arc::new(store))
      }
      #[cfg(not(feature = "redis"))]
      StoreBackend::Redis => Err(QueueError::Unsupported(
        "redis backend requested but this build lacks the `redis` feature".to_string(),
      )),
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("Queue backend unavailable: {0}")]
  Unavailable(String),
  #[error("Queue backend error: {0}")]
  Backend(String),
  #[error("Failed to encode task: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("{0}")]
  Unsupported(String),
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for QueueError {
  fn from(e: ::redis::RedisError) -> Self {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
      QueueError::Unavailable(e.to_string())
    } else {
      QueueError::Backend(e.to_string())
    }
  }
}
