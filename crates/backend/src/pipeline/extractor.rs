//! Extractor stage - Detection events in, Extraction events out.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
  StageQueues, WorkerStats,
  worker::{StageWorker, run_stage},
};
use crate::{
  collab::{CollaboratorError, TextExtractor},
  domain::{
    event::{DetectionEvent, ExtractionEvent, OriginalEvent, Stage, Task},
    identity::{candidate_id, normalize_rel_path, rel_path},
  },
  queue::{QueueError, QueueStore},
};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
  #[error("Detection event has no file path")]
  MissingFilePath,
  #[error("Text extraction failed: {0}")]
  Text(#[from] CollaboratorError),
}

pub struct Extractor {
  store: Arc<dyn QueueStore>,
  text: Arc<dyn TextExtractor>,
  queues: StageQueues,
  /// Watched root, used when an event carries no relative path
  root: Option<PathBuf>,
}

impl Extractor {
  pub fn new(store: Arc<dyn QueueStore>, text: Arc<dyn TextExtractor>, queues: StageQueues) -> Self {
    Self {
      store,
      text,
      queues,
      root: None,
    }
  }

  pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
    self.root = Some(root.into());
    self
  }

  /// Relative path the candidate id is derived from: the event's own, else
  /// the path under the watched root, else the bare file name
  fn identity_path(&self, event: &DetectionEvent, file_path: &Path) -> String {
    let from_event = normalize_rel_path(&event.source_rel_path);
    if !from_event.is_empty() {
      return from_event;
    }

    self
      .root
      .as_deref()
      .and_then(|root| rel_path(file_path, root))
      .unwrap_or_else(|| {
        file_path
          .file_name()
          .map(|name| name.to_string_lossy().to_string())
          .unwrap_or_else(|| event.file_path.clone())
      })
  }

  /// Extract one detection into the event for the next stage
  pub async fn extract(&self, event: &DetectionEvent) -> Result<ExtractionEvent, ExtractError> {
    if event.file_path.trim().is_empty() {
      return Err(ExtractError::MissingFilePath);
    }
    let file_path = PathBuf::from(&event.file_path);

    let raw_text = self.text.extract_text(&file_path).await?;
    let rel = self.identity_path(event, &file_path);

    Ok(ExtractionEvent {
      candidate_id: candidate_id(&rel),
      file_path: event.file_path.clone(),
      raw_text,
      source_category: event.source_category.clone(),
      source_rel_path: rel,
      signature: event.signature,
      event_id: event.event_id,
      detected_at: event.detected_at,
    })
  }

  /// Consume the detect queue until `cancel` fires or the store fails
  pub async fn run(&self, worker_id: usize, cancel: &CancellationToken) -> Result<WorkerStats, QueueError> {
    run_stage(self, worker_id, self.store.as_ref(), &self.queues, cancel).await
  }
}

#[async_trait]
impl StageWorker for Extractor {
  type Input = DetectionEvent;
  type Error = ExtractError;

  const STAGE: Stage = Stage::Extractor;

  fn accept(task: Task) -> Result<DetectionEvent, Task> {
    match task {
      Task::Detection(event) => Ok(event),
      other => Err(other),
    }
  }

  fn original(input: &DetectionEvent) -> OriginalEvent {
    OriginalEvent::Detection(input.clone())
  }

  fn describe(input: &DetectionEvent) -> &str {
    &input.source_rel_path
  }

  async fn process(&self, input: &DetectionEvent) -> Result<Option<Task>, ExtractError> {
    self.extract(input).await.map(|event| Some(Task::Extraction(event)))
  }
}
