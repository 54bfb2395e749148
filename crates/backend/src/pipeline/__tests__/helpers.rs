//! Fakes for pipeline tests.
//!
//! Each collaborator records what it saw and can be told to fail, so tests
//! can assert on dead letters and on what reached persistence.

use std::{
  collections::HashMap,
  path::Path,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  collab::{
    CandidateDocument, CandidateStore, CandidateTransaction, CollaboratorError, EmbeddingProvider, ExtractionHint,
    MemoryCandidateStore, SignatureLookup, StructuredExtractor, TextExtractor,
  },
  domain::{
    config::QueueConfig,
    event::{DeadLetterRecord, DetectionEvent, ExtractionEvent, FileSignature, Task},
    identity::candidate_id,
  },
  pipeline::{Enricher, Extractor, StageQueues, WorkerStats},
  queue::{MemoryQueueStore, QueueError, QueueStore},
};

pub const POP_TIMEOUT: Duration = Duration::from_millis(20);

/// Text extractor that fails for any path containing "corrupt"
#[derive(Default)]
pub struct FakeText;

#[async_trait]
impl TextExtractor for FakeText {
  async fn extract_text(&self, path: &Path) -> Result<String, CollaboratorError> {
    let name = path.to_string_lossy();
    if name.contains("corrupt") {
      return Err(CollaboratorError::Service(format!("cannot parse {}", name)));
    }
    Ok(format!("text of {}", name))
  }
}

/// Structured extractor echoing the hint back into the document
#[derive(Default)]
pub struct FakeStructured {
  pub hints: Mutex<Vec<ExtractionHint>>,
}

#[async_trait]
impl StructuredExtractor for FakeStructured {
  async fn extract(&self, text: &str, hint: &ExtractionHint) -> Result<serde_json::Value, CollaboratorError> {
    self.hints.lock().unwrap().push(hint.clone());
    Ok(serde_json::json!({
      "summary": text,
      "role": hint.role_folder,
      "category": hint.source_category,
    }))
  }
}

pub struct FakeEmbedder {
  pub dimensions: usize,
  /// Length actually returned; differs from `dimensions` to simulate a bad model
  pub returns: usize,
}

impl FakeEmbedder {
  pub fn new(dimensions: usize) -> Self {
    Self {
      dimensions,
      returns: dimensions,
    }
  }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
  fn name(&self) -> &str {
    "fake"
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
    Ok(vec![text.len() as f32; self.returns])
  }
}

/// Memory candidate store with failure switches and a rollback counter
#[derive(Default)]
pub struct FlakyCandidates {
  pub inner: MemoryCandidateStore,
  pub fail_embedding_write: Arc<AtomicBool>,
  pub fail_record_signature: AtomicBool,
  pub rollbacks: Arc<AtomicUsize>,
  pub begins: AtomicUsize,
}

#[async_trait]
impl SignatureLookup for FlakyCandidates {
  async fn last_signatures(&self, rel_paths: &[String]) -> Result<HashMap<String, FileSignature>, CollaboratorError> {
    self.inner.last_signatures(rel_paths).await
  }
}

#[async_trait]
impl CandidateStore for FlakyCandidates {
  async fn begin(&self) -> Result<Box<dyn CandidateTransaction>, CollaboratorError> {
    self.begins.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(FlakyTransaction {
      inner: self.inner.begin().await?,
      fail_embedding_write: self.fail_embedding_write.clone(),
      rollbacks: self.rollbacks.clone(),
    }))
  }

  async fn record_signature(&self, rel_path: &str, signature: FileSignature) -> Result<(), CollaboratorError> {
    if self.fail_record_signature.load(Ordering::SeqCst) {
      return Err(CollaboratorError::Storage("signature table locked".to_string()));
    }
    self.inner.record_signature(rel_path, signature).await
  }
}

struct FlakyTransaction {
  inner: Box<dyn CandidateTransaction>,
  fail_embedding_write: Arc<AtomicBool>,
  rollbacks: Arc<AtomicUsize>,
}

#[async_trait]
impl CandidateTransaction for FlakyTransaction {
  async fn upsert_candidate(&mut self, document: &CandidateDocument) -> Result<(), CollaboratorError> {
    self.inner.upsert_candidate(document).await
  }

  async fn upsert_embedding(&mut self, candidate_id: &str, embedding: &[f32]) -> Result<(), CollaboratorError> {
    if self.fail_embedding_write.load(Ordering::SeqCst) {
      return Err(CollaboratorError::Storage("vector index unavailable".to_string()));
    }
    self.inner.upsert_embedding(candidate_id, embedding).await
  }

  async fn commit(self: Box<Self>) -> Result<(), CollaboratorError> {
    self.inner.commit().await
  }

  async fn rollback(self: Box<Self>) -> Result<(), CollaboratorError> {
    self.rollbacks.fetch_add(1, Ordering::SeqCst);
    self.inner.rollback().await
  }
}

/// Queue store whose pops fail, to exercise worker shutdown on store errors
#[derive(Default)]
pub struct BrokenStore;

#[async_trait]
impl QueueStore for BrokenStore {
  fn name(&self) -> &str {
    "broken"
  }

  async fn push(&self, _queue: &str, _payload: String) -> Result<(), QueueError> {
    Err(QueueError::Unavailable("connection refused".to_string()))
  }

  async fn pop(&self, _queue: &str, _timeout: Duration) -> Result<Option<String>, QueueError> {
    Err(QueueError::Unavailable("connection refused".to_string()))
  }

  async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, QueueError> {
    Err(QueueError::Unavailable("connection refused".to_string()))
  }

  async fn release(&self, _key: &str) -> Result<(), QueueError> {
    Err(QueueError::Unavailable("connection refused".to_string()))
  }

  async fn depth(&self, _queue: &str) -> Result<usize, QueueError> {
    Err(QueueError::Unavailable("connection refused".to_string()))
  }

  async fn peek(&self, _queue: &str, _limit: usize) -> Result<Vec<String>, QueueError> {
    Err(QueueError::Unavailable("connection refused".to_string()))
  }
}

/// Memory store that refuses pushes to one queue and serves everything else
pub struct QueueOutage {
  pub inner: Arc<MemoryQueueStore>,
  pub down: String,
}

#[async_trait]
impl QueueStore for QueueOutage {
  fn name(&self) -> &str {
    "outage"
  }

  async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
    if queue == self.down {
      return Err(QueueError::Unavailable(format!("{} is down", queue)));
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

pub struct PipelineTestContext {
  pub store: Arc<MemoryQueueStore>,
  pub queues: QueueConfig,
  pub structured: Arc<FakeStructured>,
  pub candidates: Arc<FlakyCandidates>,
}

impl PipelineTestContext {
  pub fn new() -> Self {
    Self {
      store: Arc::new(MemoryQueueStore::new()),
      queues: QueueConfig {
        detect: "test:detect".to_string(),
        extract: "test:extract".to_string(),
        dead_letter: "test:dlq".to_string(),
        pop_timeout_secs: 1,
      },
      structured: Arc::new(FakeStructured::default()),
      candidates: Arc::new(FlakyCandidates::default()),
    }
  }

  pub fn extractor(&self) -> Extractor {
    Extractor::new(
      self.store.clone(),
      Arc::new(FakeText),
      StageQueues::extractor(&self.queues).with_pop_timeout(POP_TIMEOUT),
    )
  }

  pub fn enricher_with(&self, embedder: FakeEmbedder) -> Enricher {
    Enricher::new(
      self.store.clone(),
      self.structured.clone(),
      Arc::new(embedder),
      self.candidates.clone(),
      StageQueues::enricher(&self.queues).with_pop_timeout(POP_TIMEOUT),
    )
  }

  pub fn enricher(&self) -> Enricher {
    self.enricher_with(FakeEmbedder::new(8))
  }

  pub async fn push(&self, queue: &str, task: Task) {
    self.store.push_task(queue, &task).await.expect("push task");
  }

  pub fn tasks(&self, queue: &str) -> Vec<Task> {
    self
      .store
      .snapshot(queue)
      .iter()
      .map(|payload| Task::decode(payload).expect("decode task"))
      .collect()
  }

  pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
    self
      .tasks(&self.queues.dead_letter)
      .into_iter()
      .map(|task| match task {
        Task::DeadLetter(record) => record,
        other => panic!("expected dead letter, got {}", other.kind()),
      })
      .collect()
  }

  pub fn extractions(&self) -> Vec<ExtractionEvent> {
    self
      .tasks(&self.queues.extract)
      .into_iter()
      .map(|task| match task {
        Task::Extraction(event) => event,
        other => panic!("expected extraction, got {}", other.kind()),
      })
      .collect()
  }

  /// Wait until `queue` is empty, then give in-flight work a moment
  pub async fn wait_drained(&self, queue: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while self.store.depth(queue).await.unwrap() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("queue should drain");
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
}

pub fn detection(file_path: &str, rel: &str) -> DetectionEvent {
  DetectionEvent {
    event_id: Uuid::new_v4(),
    detected_at: Utc::now(),
    file_path: file_path.to_string(),
    source_rel_path: rel.to_string(),
    source_category: rel.split_once('/').map(|(first, _)| first.to_string()),
    signature: FileSignature::new(1_700_000_000_000_000_000, 512),
  }
}

pub fn extraction(rel: &str, text: &str) -> ExtractionEvent {
  ExtractionEvent {
    candidate_id: candidate_id(rel),
    file_path: format!("/inbox/{}", rel),
    raw_text: text.to_string(),
    source_category: rel.split_once('/').map(|(first, _)| first.to_string()),
    source_rel_path: rel.to_string(),
    signature: FileSignature::new(1_700_000_000_000_000_000, 512),
    event_id: Uuid::new_v4(),
    detected_at: Utc::now(),
  }
}

/// Run a worker until `queue` drains, then cancel it and return its stats
pub async fn run_until_drained<F, Fut>(ctx: &PipelineTestContext, queue: &str, run: F) -> WorkerStats
where
  F: FnOnce(CancellationToken) -> Fut,
  Fut: std::future::Future<Output = Result<WorkerStats, QueueError>> + Send + 'static,
{
  let cancel = CancellationToken::new();
  let handle = tokio::spawn(run(cancel.clone()));
  ctx.wait_drained(queue).await;
  cancel.cancel();
  handle.await.expect("worker task").expect("worker result")
}
