//! Redis-backed queue/store, shared by every watcher and worker process.
//!
//! Queues are lists (RPUSH / LPOP / LRANGE), dedup markers are `SET key 1 NX PX ttl`.
//!
//! Every clone of the `ConnectionManager` shares one multiplexed socket, and a
//! blocking command holds that socket for its whole wait. Pops therefore poll
//! with non-blocking LPOP and a short idle backoff instead of using BLPOP.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{QueueError, QueueStore};

const POLL_MIN: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_millis(200);

/// Idle backoff between empty LPOPs: doubles up to `POLL_MAX`
fn next_poll_delay(previous: Duration) -> Duration {
  (previous * 2).clamp(POLL_MIN, POLL_MAX)
}

#[derive(Clone)]
pub struct RedisQueueStore {
  conn: ConnectionManager,
}

impl fmt::Debug for RedisQueueStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RedisQueueStore")
      .field("connection", &"ConnectionManager")
      .finish()
  }
}

impl RedisQueueStore {
  pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
    info!("Connecting to Redis queue store at {}", redis_url);

    let client = redis::Client::open(redis_url)?;
    let conn = ConnectionManager::new(client).await?;

    info!("Connected to Redis queue store");
    Ok(Self { conn })
  }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
  fn name(&self) -> &str {
    "redis"
  }

  async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    redis::cmd("RPUSH")
      .arg(queue)
      .arg(payload)
      .query_async::<i64>(&mut conn)
      .await?;
    Ok(())
  }

  async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
    let deadline = Instant::now() + timeout;
    let mut delay = POLL_MIN;

    loop {
      let mut conn = self.conn.clone();
      let popped: Option<String> = redis::cmd("LPOP").arg(queue).query_async(&mut conn).await?;
      if popped.is_some() {
        return Ok(popped);
      }

      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      tokio::time::sleep(delay.min(deadline - now)).await;
      delay = next_poll_delay(delay);
    }
  }

  async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
    let mut conn = self.conn.clone();
    let ttl_ms = ttl.as_millis().max(1) as u64;
    let reply: Option<String> = redis::cmd("SET")
      .arg(key)
      .arg("1")
      .arg("NX")
      .arg("PX")
      .arg(ttl_ms)
      .query_async(&mut conn)
      .await?;

    let created = reply.is_some();
    debug!(key, created, "Redis SET NX");
    Ok(created)
  }

  async fn release(&self, key: &str) -> Result<(), QueueError> {
    let mut conn = self.conn.clone();
    let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
    debug!(key, removed, "Redis DEL");
    Ok(())
  }

  async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
    let mut conn = self.conn.clone();
    let len: usize = redis::cmd("LLEN").arg(queue).query_async(&mut conn).await?;
    Ok(len)
  }

  async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
    if limit == 0 {
      return Ok(Vec::new());
    }
    let mut conn = self.conn.clone();
    let payloads: Vec<String> = redis::cmd("LRANGE")
      .arg(queue)
      .arg(0)
      .arg(limit as i64 - 1)
      .query_async(&mut conn)
      .await?;
    Ok(payloads)
  }
}
