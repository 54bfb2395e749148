//! Test helpers for watch service tests.
//!
//! `WatchTestContext` owns a temporary root, an in-memory queue store and a
//! signature lookup that can be switched into a failing mode.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
  time::{Duration, SystemTime},
};

use async_trait::async_trait;
use filetime::{FileTime, set_file_mtime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
  collab::{CandidateStore, CollaboratorError, MemoryCandidateStore, SignatureLookup},
  domain::{
    config::WatchConfig,
    event::{DetectionEvent, FileSignature, Task},
  },
  queue::{MemoryQueueStore, QueueError, QueueStore},
  watch::FileWatchService,
};

pub const DETECT_QUEUE: &str = "test:detect";

/// Signature lookup backed by a memory store, with an outage switch
#[derive(Default)]
pub struct SwitchableSignatures {
  pub store: MemoryCandidateStore,
  pub failing: AtomicBool,
}

#[async_trait]
impl SignatureLookup for SwitchableSignatures {
  async fn last_signatures(&self, rel_paths: &[String]) -> Result<HashMap<String, FileSignature>, CollaboratorError> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(CollaboratorError::Storage("database offline".to_string()));
    }
    self.store.last_signatures(rel_paths).await
  }
}

/// Memory store whose pushes can be delayed or made to fail a number of times
pub struct GatedStore {
  pub inner: Arc<MemoryQueueStore>,
  pub failing_pushes: AtomicUsize,
  pub push_delay_ms: AtomicU64,
}

impl GatedStore {
  pub fn new(inner: Arc<MemoryQueueStore>) -> Self {
    Self {
      inner,
      failing_pushes: AtomicUsize::new(0),
      push_delay_ms: AtomicU64::new(0),
    }
  }
}

#[async_trait]
impl QueueStore for GatedStore {
  fn name(&self) -> &str {
    "gated"
  }

  async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
    let delay = self.push_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if self
      .failing_pushes
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(QueueError::Unavailable("blip".to_string()));
    }
    self.inner.push(queue, payload).await
  }

  async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
    self.inner.pop(queue, timeout).await
  }

  async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
    self.inner.set_if_absent(key, ttl).await
  }

  async fn release(&self, key: &str) -> Result<(), QueueError> {
    self.inner.release(key).await
  }

  async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
    self.inner.depth(queue).await
  }

  async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
    self.inner.peek(queue, limit).await
  }
}

pub struct WatchTestContext {
  pub root: TempDir,
  pub store: Arc<MemoryQueueStore>,
  pub signatures: Arc<SwitchableSignatures>,
  pub config: WatchConfig,
  pub cancel: CancellationToken,
}

impl WatchTestContext {
  /// Short debounce and stability windows, reconciliation driven by hand
  pub fn new() -> Self {
    let root = TempDir::new().expect("create root temp dir");
    let config = WatchConfig {
      root: root.path().to_path_buf(),
      debounce_ms: 50,
      stable_ms: 100,
      reconcile: false,
      reconcile_interval_secs: 0,
      shutdown_timeout_secs: 2,
      ..Default::default()
    };

    Self {
      root,
      store: Arc::new(MemoryQueueStore::new()),
      signatures: Arc::new(SwitchableSignatures::default()),
      config,
      cancel: CancellationToken::new(),
    }
  }

  pub fn service(&self) -> FileWatchService {
    self.service_with(self.store.clone())
  }

  /// Service publishing through `store`; `detections()` still reads the shared memory store
  pub fn service_with(&self, store: Arc<dyn QueueStore>) -> FileWatchService {
    FileWatchService::new(
      self.config.clone(),
      store,
      self.signatures.clone(),
      DETECT_QUEUE,
      &self.cancel,
    )
    .expect("create watch service")
  }

  /// Canonical path of `rel` under the root
  pub fn path(&self, rel: &str) -> PathBuf {
    self.root.path().canonicalize().expect("canonical root").join(rel)
  }

  /// Write a file, creating parent folders
  pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
    let path = self.path(rel);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    std::fs::write(&path, contents).expect("write file");
    path
  }

  /// Write a file whose mtime lies `age` in the past
  pub fn write_aged(&self, rel: &str, contents: &str, age: Duration) -> PathBuf {
    let path = self.write(rel, contents);
    set_mtime(&path, SystemTime::now() - age);
    path
  }

  pub fn detections(&self) -> Vec<DetectionEvent> {
    self
      .store
      .snapshot(DETECT_QUEUE)
      .iter()
      .map(|payload| match Task::decode(payload).expect("decode task") {
        Task::Detection(event) => event,
        other => panic!("expected detection on detect queue, got {}", other.kind()),
      })
      .collect()
  }

  pub async fn record_processed(&self, path: &Path, rel: &str) {
    let signature = FileSignature::of(path).await.expect("signature");
    self
      .signatures
      .store
      .record_signature(rel, signature)
      .await
      .expect("record signature");
  }
}

impl WatchTestContext {
  /// Gated wrapper around the context's memory store
  pub fn gated(&self) -> Arc<GatedStore> {
    Arc::new(GatedStore::new(self.store.clone()))
  }
}

pub fn set_mtime(path: &Path, at: SystemTime) {
  set_file_mtime(path, FileTime::from_system_time(at)).expect("set mtime");
}
