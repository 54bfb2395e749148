//! CoalescingScheduler - per-path debounce with a single timer loop
//!
//! Every `notify(path)` pushes that path's deadline to `now + debounce`, so a
//! burst of writes collapses into one callback fired after the burst goes
//! quiet. One background task sleeps until the earliest deadline, removes the
//! entry and hands the path to the callback in its own tracked task. A slow
//! callback (the stability check sleeps) therefore never delays the other
//! timers.
//!
//! # Failure isolation
//!
//! Callback errors and panics are caught and logged, at warn level at most
//! once per [`ERROR_LOG_INTERVAL`]. They never stop the loop.
//!
//! # Lifecycle
//!
//! `notify` may be called before `start`; entries simply wait. After `stop`,
//! `notify` is a no-op so in-flight callbacks can still re-notify safely.

use std::{
  collections::HashMap,
  future::Future,
  panic::AssertUnwindSafe,
  path::PathBuf,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

/// Minimum spacing between warn-level callback failure logs
pub const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

type Callback<E> = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

struct Inner {
  debounce: Duration,
  due_at: Mutex<HashMap<PathBuf, Instant>>,
  wake: Notify,
  cancel: CancellationToken,
  tracker: TaskTracker,
  last_error_log: Mutex<Option<Instant>>,
}

impl Inner {
  fn due_map(&self) -> MutexGuard<'_, HashMap<PathBuf, Instant>> {
    self.due_at.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Remove and return the earliest path whose deadline has passed,
  /// otherwise the earliest deadline still pending.
  fn pop_due(&self, now: Instant) -> Result<PathBuf, Option<Instant>> {
    let mut due_at = self.due_map();
    let Some((path, due)) = due_at.iter().min_by_key(|(_, due)| **due).map(|(p, d)| (p.clone(), *d)) else {
      return Err(None);
    };

    if due > now {
      return Err(Some(due));
    }
    due_at.remove(&path);
    Ok(path)
  }

  fn report_failure(&self, path: &PathBuf, error: &str) {
    let now = Instant::now();
    let mut last = self.last_error_log.lock().unwrap_or_else(PoisonError::into_inner);
    let loud = last.is_none_or(|at| now.duration_since(at) >= ERROR_LOG_INTERVAL);

    if loud {
      *last = Some(now);
      warn!(path = %path.display(), error, "Error while handling path");
    } else {
      debug!(path = %path.display(), error, "Error while handling path (rate limited)");
    }
  }
}

/// Cheap handle used to feed paths into a scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
  inner: Arc<Inner>,
}

impl std::fmt::Debug for SchedulerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SchedulerHandle")
      .field("debounce", &self.inner.debounce)
      .field("pending", &self.pending())
      .finish()
  }
}

impl SchedulerHandle {
  /// (Re)arm the debounce timer for `path`
  pub fn notify(&self, path: PathBuf) {
    if self.inner.cancel.is_cancelled() {
      trace!(path = %path.display(), "Scheduler stopped, dropping notification");
      return;
    }

    let due = Instant::now() + self.inner.debounce;
    self.inner.due_map().insert(path, due);
    self.inner.wake.notify_one();
  }

  /// Number of paths waiting for their deadline
  pub fn pending(&self) -> usize {
    self.inner.due_map().len()
  }

  pub fn is_stopped(&self) -> bool {
    self.inner.cancel.is_cancelled()
  }
}

pub struct CoalescingScheduler {
  handle: SchedulerHandle,
  loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoalescingScheduler {
  pub fn new(debounce: Duration, cancel: CancellationToken) -> Self {
    let inner = Arc::new(Inner {
      debounce,
      due_at: Mutex::new(HashMap::new()),
      wake: Notify::new(),
      cancel,
      tracker: TaskTracker::new(),
      last_error_log: Mutex::new(None),
    });

    Self {
      handle: SchedulerHandle { inner },
      loop_task: Mutex::new(None),
    }
  }

  pub fn handle(&self) -> SchedulerHandle {
    self.handle.clone()
  }

  pub fn notify(&self, path: PathBuf) {
    self.handle.notify(path);
  }

  pub fn pending(&self) -> usize {
    self.handle.pending()
  }

  /// Spawn the timer loop. Calling `start` twice keeps the first loop.
  pub fn start<F, Fut, E>(&self, callback: F)
  where
    F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
  {
    let mut slot = self.loop_task.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
      debug!("Scheduler already started");
      return;
    }

    let callback: Callback<E> = Arc::new(move |path| callback(path).boxed());
    let inner = self.handle.inner.clone();
    *slot = Some(tokio::spawn(run_loop(inner, callback)));
  }

  /// Stop the loop and wait (bounded) for in-flight callbacks
  pub async fn stop(&self, timeout: Duration) {
    let inner = &self.handle.inner;
    inner.cancel.cancel();
    inner.wake.notify_one();

    let loop_task = self.loop_task.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(mut task) = loop_task
      && tokio::time::timeout(timeout, &mut task).await.is_err()
    {
      warn!("Scheduler loop did not stop in time, aborting");
      task.abort();
    }

    inner.tracker.close();
    if tokio::time::timeout(timeout, inner.tracker.wait()).await.is_err() {
      warn!(in_flight = inner.tracker.len(), "Timed out waiting for in-flight path handlers");
    }

    let dropped = {
      let mut due_at = inner.due_map();
      let n = due_at.len();
      due_at.clear();
      n
    };
    info!(dropped, "Scheduler stopped");
  }
}

async fn run_loop<E>(inner: Arc<Inner>, callback: Callback<E>)
where
  E: std::fmt::Display + Send + 'static,
{
  debug!(debounce_ms = inner.debounce.as_millis() as u64, "Scheduler loop started");

  loop {
    if inner.cancel.is_cancelled() {
      break;
    }

    match inner.pop_due(Instant::now()) {
      Ok(path) => dispatch(&inner, &callback, path),
      Err(Some(deadline)) => {
        tokio::select! {
          biased;
          _ = inner.cancel.cancelled() => break,
          _ = inner.wake.notified() => {}
          _ = tokio::time::sleep_until(deadline) => {}
        }
      }
      Err(None) => {
        tokio::select! {
          biased;
          _ = inner.cancel.cancelled() => break,
          _ = inner.wake.notified() => {}
        }
      }
    }
  }

  debug!("Scheduler loop exited");
}

fn dispatch<E>(inner: &Arc<Inner>, callback: &Callback<E>, path: PathBuf)
where
  E: std::fmt::Display + Send + 'static,
{
  trace!(path = %path.display(), "Debounce settled");

  let callback = callback.clone();
  let owner = inner.clone();
  inner.tracker.spawn(async move {
    let outcome = AssertUnwindSafe(async { callback(path.clone()).await })
      .catch_unwind()
      .await;

    match outcome {
      Ok(Ok(())) => {}
      Ok(Err(e)) => owner.report_failure(&path, &e.to_string()),
      Err(panic) => {
        let message = panic
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| panic.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "handler panicked".to_string());
        owner.report_failure(&path, &message);
      }
    }
  });
}
