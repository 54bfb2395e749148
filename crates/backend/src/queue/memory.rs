//! In-process queue/store backend.
//!
//! Queues are plain `VecDeque`s behind one mutex; waiting poppers park on a
//! `Notify` that every push wakes. Dedup keys live in a moka cache whose
//! per-entry expiry is the TTL passed to `set_if_absent`.

use std::{
  collections::{HashMap, VecDeque},
  sync::Mutex,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use tokio::sync::Notify;
use tracing::trace;

use super::{QueueError, QueueStore};

/// Expires each dedup key after the TTL it was created with
struct TtlExpiry;

impl Expiry<String, Duration> for TtlExpiry {
  fn expire_after_create(&self, _key: &String, ttl: &Duration, _created_at: Instant) -> Option<Duration> {
    Some(*ttl)
  }
}

pub struct MemoryQueueStore {
  queues: Mutex<HashMap<String, VecDeque<String>>>,
  pushed: Notify,
  keys: Cache<String, Duration>,
}

impl std::fmt::Debug for MemoryQueueStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MemoryQueueStore")
      .field("keys", &self.keys.entry_count())
      .finish_non_exhaustive()
  }
}

impl Default for MemoryQueueStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self {
      queues: Mutex::new(HashMap::new()),
      pushed: Notify::new(),
      keys: Cache::builder().expire_after(TtlExpiry).build(),
    }
  }

  fn try_pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
    let mut queues = self.lock()?;
    Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<String>>>, QueueError> {
    self
      .queues
      .lock()
      .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
  }

  /// Copy of everything waiting in a queue, oldest first
  pub fn snapshot(&self, queue: &str) -> Vec<String> {
    self
      .lock()
      .map(|queues| queues.get(queue).map(|q| q.iter().cloned().collect()).unwrap_or_default())
      .unwrap_or_default()
  }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
  fn name(&self) -> &str {
    "memory"
  }

  async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
    {
      let mut queues = self.lock()?;
      queues.entry(queue.to_string()).or_default().push_back(payload);
    }
    trace!(queue, "Pushed payload");
    self.pushed.notify_waiters();
    Ok(())
  }

  async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
      // Register interest before checking so a push in between is not missed
      let notified = self.pushed.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(payload) = self.try_pop(queue)? {
        return Ok(Some(payload));
      }

      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return self.try_pop(queue);
      }
    }
  }

  async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
    let entry = self.keys.entry(key.to_string()).or_insert(ttl).await;
    Ok(entry.is_fresh())
  }

  async fn release(&self, key: &str) -> Result<(), QueueError> {
    self.keys.invalidate(key).await;
    Ok(())
  }

  async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
    Ok(self.lock()?.get(queue).map_or(0, VecDeque::len))
  }

  async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
    let queues = self.lock()?;
    Ok(
      queues
        .get(queue)
        .map(|q| q.iter().take(limit).cloned().collect())
        .unwrap_or_default(),
    )
  }
}
