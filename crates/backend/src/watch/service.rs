//! FileWatchService - live monitoring plus periodic reconciliation
//!
//! # Lifecycle
//!
//! `new` creates and canonicalizes the root. `start` runs the startup
//! reconciliation, then starts the scheduler, the `notify` watcher and the
//! reconcile loop. `stop` tears them down in reverse, watcher first so no new
//! notifications arrive while the scheduler drains.

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Duration,
};

use notify::{
  Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
  event::{ModifyKind, RenameMode},
};
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
  WatchError,
  reconcile::ReconcileReport,
  scheduler::{CoalescingScheduler, SchedulerHandle},
};
use crate::{
  collab::SignatureLookup,
  domain::{
    config::WatchConfig,
    event::{DetectionEvent, FileSignature, Task},
    identity::{dedupe_key, rel_path},
  },
  queue::QueueStore,
  selection::{FileFilter, FileSelector},
};

// ============================================================================
// Outcomes and counters
// ============================================================================

/// What happened to one path after its debounce settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
  /// Not a CV payload: filtered by name, not a regular file, or outside the root
  Ignored,
  /// Gone before the stability check finished
  Vanished,
  /// Changed during the stability window; re-queued in the scheduler
  Restabilizing,
  /// Lost arbitration to a sibling in the same candidate folder
  Superseded,
  /// This exact signature was already published within the dedup TTL
  Duplicate,
  Published(DetectionEvent),
}

/// Counters for one service run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchStats {
  pub notifications: u64,
  pub published: u64,
  pub duplicates: u64,
  pub superseded: u64,
  pub restabilized: u64,
  pub vanished: u64,
  pub ignored: u64,
  pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
  notifications: AtomicU64,
  published: AtomicU64,
  duplicates: AtomicU64,
  superseded: AtomicU64,
  restabilized: AtomicU64,
  vanished: AtomicU64,
  ignored: AtomicU64,
  errors: AtomicU64,
}

impl Counters {
  fn record(&self, outcome: &PathOutcome) {
    let counter = match outcome {
      PathOutcome::Ignored => &self.ignored,
      PathOutcome::Vanished => &self.vanished,
      PathOutcome::Restabilizing => &self.restabilized,
      PathOutcome::Superseded => &self.superseded,
      PathOutcome::Duplicate => &self.duplicates,
      PathOutcome::Published(_) => &self.published,
    };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> WatchStats {
    WatchStats {
      notifications: self.notifications.load(Ordering::Relaxed),
      published: self.published.load(Ordering::Relaxed),
      duplicates: self.duplicates.load(Ordering::Relaxed),
      superseded: self.superseded.load(Ordering::Relaxed),
      restabilized: self.restabilized.load(Ordering::Relaxed),
      vanished: self.vanished.load(Ordering::Relaxed),
      ignored: self.ignored.load(Ordering::Relaxed),
      errors: self.errors.load(Ordering::Relaxed),
    }
  }
}

// ============================================================================
// Shared core
// ============================================================================

/// State shared by the scheduler callback, the reconcile loop and the service
pub(super) struct WatchCore {
  pub(super) config: WatchConfig,
  pub(super) selector: Arc<FileSelector>,
  pub(super) store: Arc<dyn QueueStore>,
  pub(super) signatures: Arc<dyn SignatureLookup>,
  pub(super) detect_queue: String,
  scheduler: SchedulerHandle,
  counters: Counters,
}

/// Result of one stat call
enum Observation {
  Missing,
  NotAFile,
  File(FileSignature),
}

impl WatchCore {
  async fn observe(path: &Path) -> Result<Observation, WatchError> {
    match tokio::fs::metadata(path).await {
      Ok(meta) if !meta.is_file() => Ok(Observation::NotAFile),
      Ok(meta) => FileSignature::from_metadata(&meta)
        .map(Observation::File)
        .map_err(|e| WatchError::io(path, e)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Observation::Missing),
      Err(e) => Err(WatchError::io(path, e)),
    }
  }

  pub(super) async fn process_path(&self, path: &Path) -> Result<PathOutcome, WatchError> {
    let outcome = self.evaluate(path).await;
    match &outcome {
      Ok(outcome) => self.counters.record(outcome),
      Err(_) => {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
      }
    }
    outcome
  }

  async fn evaluate(&self, path: &Path) -> Result<PathOutcome, WatchError> {
    if !self.selector.filter().matches_name(path) {
      trace!(path = %path.display(), "Filtered by name");
      return Ok(PathOutcome::Ignored);
    }
    let Some(rel) = rel_path(path, self.selector.root()) else {
      trace!(path = %path.display(), "Outside watched root");
      return Ok(PathOutcome::Ignored);
    };

    let before = match Self::observe(path).await? {
      Observation::File(signature) => signature,
      Observation::NotAFile => return Ok(PathOutcome::Ignored),
      Observation::Missing => {
        debug!(path = %path.display(), "File vanished before stability check");
        return Ok(PathOutcome::Vanished);
      }
    };

    tokio::time::sleep(self.config.stable_window()).await;

    let after = match Self::observe(path).await? {
      Observation::File(signature) => signature,
      Observation::NotAFile => return Ok(PathOutcome::Ignored),
      Observation::Missing => {
        debug!(path = %path.display(), "File vanished during stability window");
        return Ok(PathOutcome::Vanished);
      }
    };

    if before != after {
      debug!(path = %path.display(), %before, %after, "Still changing, restabilizing");
      self.scheduler.notify(path.to_path_buf());
      return Ok(PathOutcome::Restabilizing);
    }

    let selector = self.selector.clone();
    let candidate = path.to_path_buf();
    if !tokio::task::spawn_blocking(move || selector.is_latest(&candidate)).await? {
      debug!(path = %path.display(), "Superseded by a sibling");
      return Ok(PathOutcome::Superseded);
    }

    self.publish_if_new(path, rel, after).await
  }

  /// Claim the dedup key and push the detection on a detached task, so a
  /// dropped caller (stop, cancelled reconciliation) never strands a claimed
  /// key without its detection
  async fn publish_if_new(&self, path: &Path, rel: String, signature: FileSignature) -> Result<PathOutcome, WatchError> {
    let event = DetectionEvent::new(path, rel, signature);
    let publish = tokio::spawn(publish(
      self.store.clone(),
      self.detect_queue.clone(),
      self.config.dedupe_ttl(),
      event,
    ));
    publish.await?
  }
}

async fn publish(
  store: Arc<dyn QueueStore>,
  queue: String,
  ttl: Duration,
  event: DetectionEvent,
) -> Result<PathOutcome, WatchError> {
  let key = dedupe_key(&event.source_rel_path, &event.signature);
  if !store.set_if_absent(&key, ttl).await? {
    debug!(rel = %event.source_rel_path, signature = %event.signature, "Already published within dedup window");
    return Ok(PathOutcome::Duplicate);
  }

  // A key must never outlive a push that failed
  if let Err(e) = store.push_task(&queue, &Task::Detection(event.clone())).await {
    if let Err(release) = store.release(&key).await {
      error!(key = %key, error = %release, "Failed to release dedup key after failed push");
    }
    return Err(e.into());
  }

  info!(
    rel = %event.source_rel_path,
    event_id = %event.event_id,
    queue = %queue,
    "Published detection"
  );
  Ok(PathOutcome::Published(event))
}

// ============================================================================
// Service
// ============================================================================

pub struct FileWatchService {
  core: Arc<WatchCore>,
  scheduler: CoalescingScheduler,
  cancel: CancellationToken,
  started: AtomicBool,
  // Dropping the watcher stops its notification thread
  watcher: Mutex<Option<Box<dyn Watcher + Send>>>,
  reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatchService {
  /// Build a service over `config.root`, creating the folder when missing.
  ///
  /// `cancel` is the parent token; cancelling it stops every task the service
  /// spawns.
  pub fn new(
    config: WatchConfig,
    store: Arc<dyn QueueStore>,
    signatures: Arc<dyn SignatureLookup>,
    detect_queue: impl Into<String>,
    cancel: &CancellationToken,
  ) -> Result<Self, WatchError> {
    std::fs::create_dir_all(&config.root).map_err(|e| WatchError::io(&config.root, e))?;
    let root = config.root.canonicalize().map_err(|e| WatchError::io(&config.root, e))?;

    let cancel = cancel.child_token();
    let scheduler = CoalescingScheduler::new(config.debounce(), cancel.child_token());
    let selector = FileSelector::new(root, FileFilter::from_config(&config));

    let core = Arc::new(WatchCore {
      config,
      selector: Arc::new(selector),
      store,
      signatures,
      detect_queue: detect_queue.into(),
      scheduler: scheduler.handle(),
      counters: Counters::default(),
    });

    Ok(Self {
      core,
      scheduler,
      cancel,
      started: AtomicBool::new(false),
      watcher: Mutex::new(None),
      reconcile_task: Mutex::new(None),
    })
  }

  /// Canonical watched root
  pub fn root(&self) -> &Path {
    self.core.selector.root()
  }

  pub fn stats(&self) -> WatchStats {
    self.core.counters.snapshot()
  }

  pub fn scheduler(&self) -> SchedulerHandle {
    self.scheduler.handle()
  }

  /// Run one path through stability, arbitration, dedup and publish
  pub async fn process_path(&self, path: &Path) -> Result<PathOutcome, WatchError> {
    self.core.process_path(path).await
  }

  /// One full scan of the root
  pub async fn reconcile_once(&self) -> Result<ReconcileReport, WatchError> {
    self.core.reconcile_once().await
  }

  pub async fn start(&self) -> Result<(), WatchError> {
    if self.started.swap(true, Ordering::SeqCst) {
      debug!("Watch service already started");
      return Ok(());
    }

    let config = &self.core.config;
    info!(
      root = %self.root().display(),
      queue = %self.core.detect_queue,
      store = self.core.store.name(),
      poll = config.poll,
      "Starting file watch service"
    );

    if config.reconcile {
      let report = self.core.reconcile_once().await?;
      info!(
        scanned = report.scanned,
        published = report.published,
        unchanged = report.unchanged,
        "Startup reconciliation complete"
      );
    }

    let core = self.core.clone();
    self.scheduler.start(move |path: PathBuf| {
      let core = core.clone();
      async move { core.process_path(&path).await.map(|_| ()) }
    });

    let watcher = self.build_watcher()?;
    *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);

    if config.reconcile
      && let Some(interval) = config.reconcile_interval()
    {
      let task = tokio::spawn(reconcile_loop(self.core.clone(), interval, self.cancel.clone()));
      *self.reconcile_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    info!(root = %self.root().display(), "File watch service started");
    Ok(())
  }

  fn build_watcher(&self) -> Result<Box<dyn Watcher + Send>, WatchError> {
    let config = &self.core.config;
    let mut watcher: Box<dyn Watcher + Send> = if config.poll {
      let notify_config = Config::default().with_poll_interval(config.poll_interval());
      Box::new(PollWatcher::new(event_handler(self.core.clone()), notify_config).map_err(WatchError::Init)?)
    } else {
      Box::new(RecommendedWatcher::new(event_handler(self.core.clone()), Config::default()).map_err(WatchError::Init)?)
    };

    watcher
      .watch(self.root(), RecursiveMode::Recursive)
      .map_err(WatchError::Watch)?;
    Ok(watcher)
  }

  /// Halt the watcher, cancel reconciliation and drain the scheduler, all
  /// within `timeout`
  pub async fn stop(&self, timeout: Duration) -> WatchStats {
    let deadline = Instant::now() + timeout;

    let watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
    drop(watcher);

    self.cancel.cancel();

    let reconcile = self.reconcile_task.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(mut task) = reconcile
      && tokio::time::timeout_at(deadline, &mut task).await.is_err()
    {
      warn!("Reconcile loop did not stop in time, aborting");
      task.abort();
    }

    self
      .scheduler
      .stop(deadline.saturating_duration_since(Instant::now()))
      .await;

    let stats = self.stats();
    info!(
      published = stats.published,
      duplicates = stats.duplicates,
      errors = stats.errors,
      "File watch service stopped"
    );
    stats
  }

  /// Start, wait for the parent token, then stop with the configured timeout
  pub async fn run_until_cancelled(&self) -> Result<WatchStats, WatchError> {
    self.start().await?;
    self.cancel.cancelled().await;
    Ok(self.stop(self.core.config.shutdown_timeout()).await)
  }
}

/// Paths worth re-checking for one notify event
fn changed_paths(event: Event) -> Vec<PathBuf> {
  match event.kind {
    EventKind::Create(_) => event.paths,
    // paths[0] = from, paths[1] = to
    EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.into_iter().skip(1).take(1).collect(),
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Vec::new(),
    EventKind::Modify(_) => event.paths,
    EventKind::Remove(_) | EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
  }
}

/// Runs on notify's thread; only touches the scheduler map
fn event_handler(core: Arc<WatchCore>) -> impl FnMut(notify::Result<Event>) + Send + 'static {
  move |res| match res {
    Ok(event) => {
      for path in changed_paths(event) {
        if path.is_dir() {
          continue;
        }
        core.counters.notifications.fetch_add(1, Ordering::Relaxed);
        core.scheduler.notify(path);
      }
    }
    Err(e) => warn!(error = %e, "Watcher error"),
  }
}

async fn reconcile_loop(core: Arc<WatchCore>, interval: Duration, cancel: CancellationToken) {
  debug!(interval_secs = interval.as_secs(), "Reconcile loop started");
  let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => break,

      // A started pass runs to completion; stop() bounds it with its deadline
      _ = ticker.tick() => match core.reconcile_once().await {
        Ok(report) => debug!(
          scanned = report.scanned,
          published = report.published,
          lookup_failed = report.lookup_failed,
          "Periodic reconciliation complete"
        ),
        Err(e) => error!(error = %e, "Periodic reconciliation failed"),
      }
    }
  }

  debug!("Reconcile loop stopped");
}
