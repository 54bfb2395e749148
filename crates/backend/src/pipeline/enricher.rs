//! Enricher stage - structured extraction, embedding and persistence.
//!
//! Candidate and embedding are written in one transaction. Any failure after
//! `begin` rolls it back, so a dead-lettered enrichment leaves no partial
//! record. The processed signature is recorded only after commit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
  StageQueues, WorkerStats,
  worker::{StageWorker, run_stage},
};
use crate::{
  collab::{CandidateDocument, CandidateStore, CollaboratorError, EmbeddingProvider, ExtractionHint, StructuredExtractor},
  domain::{
    event::{ExtractionEvent, OriginalEvent, Stage, Task},
    identity::role_folder,
  },
  queue::{QueueError, QueueStore},
};

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
  #[error("Extraction event has no text")]
  EmptyText,
  #[error("Structured extraction failed: {0}")]
  Structured(#[source] CollaboratorError),
  #[error("Embedding failed: {0}")]
  Embedding(#[source] CollaboratorError),
  #[error("Embedding from {provider} has {actual} dimensions, expected {expected}")]
  Dimensions {
    provider: String,
    expected: usize,
    actual: usize,
  },
  #[error("Persistence failed: {0}")]
  Persistence(#[source] CollaboratorError),
}

pub struct Enricher {
  store: Arc<dyn QueueStore>,
  structured: Arc<dyn StructuredExtractor>,
  embedder: Arc<dyn EmbeddingProvider>,
  candidates: Arc<dyn CandidateStore>,
  queues: StageQueues,
}

impl Enricher {
  pub fn new(
    store: Arc<dyn QueueStore>,
    structured: Arc<dyn StructuredExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    candidates: Arc<dyn CandidateStore>,
    queues: StageQueues,
  ) -> Self {
    Self {
      store,
      structured,
      embedder,
      candidates,
      queues,
    }
  }

  /// Enrich and persist one extraction
  pub async fn enrich(&self, event: &ExtractionEvent) -> Result<(), EnrichError> {
    if event.raw_text.trim().is_empty() {
      return Err(EnrichError::EmptyText);
    }

    let hint = ExtractionHint {
      source_category: event.source_category.clone(),
      role_folder: role_folder(&event.source_rel_path),
    };
    let structured = self
      .structured
      .extract(&event.raw_text, &hint)
      .await
      .map_err(EnrichError::Structured)?;

    let embedding = self.embedder.embed(&event.raw_text).await.map_err(EnrichError::Embedding)?;
    if embedding.len() != self.embedder.dimensions() {
      return Err(EnrichError::Dimensions {
        provider: self.embedder.name().to_string(),
        expected: self.embedder.dimensions(),
        actual: embedding.len(),
      });
    }

    let document = CandidateDocument {
      candidate_id: event.candidate_id.clone(),
      source_rel_path: event.source_rel_path.clone(),
      source_category: event.source_category.clone(),
      file_path: event.file_path.clone(),
      structured,
      raw_text: event.raw_text.clone(),
      signature: event.signature,
      detected_at: event.detected_at,
      enriched_at: Utc::now(),
    };

    let mut tx = self.candidates.begin().await.map_err(EnrichError::Persistence)?;
    let written = match tx.upsert_candidate(&document).await {
      Ok(()) => tx.upsert_embedding(&document.candidate_id, &embedding).await,
      Err(e) => Err(e),
    };

    if let Err(e) = written {
      if let Err(rollback) = tx.rollback().await {
        warn!(candidate_id = %event.candidate_id, error = %rollback, "Rollback failed");
      }
      return Err(EnrichError::Persistence(e));
    }
    tx.commit().await.map_err(EnrichError::Persistence)?;

    if let Err(e) = self
      .candidates
      .record_signature(&event.source_rel_path, event.signature)
      .await
    {
      warn!(rel = %event.source_rel_path, error = %e, "Failed to record processed signature");
    }

    debug!(candidate_id = %event.candidate_id, dims = embedding.len(), "Candidate enriched");
    Ok(())
  }

  /// Consume the extract queue until `cancel` fires or the store fails
  pub async fn run(&self, worker_id: usize, cancel: &CancellationToken) -> Result<WorkerStats, QueueError> {
    run_stage(self, worker_id, self.store.as_ref(), &self.queues, cancel).await
  }
}

#[async_trait]
impl StageWorker for Enricher {
  type Input = ExtractionEvent;
  type Error = EnrichError;

  const STAGE: Stage = Stage::Enricher;

  fn accept(task: Task) -> Result<ExtractionEvent, Task> {
    match task {
      Task::Extraction(event) => Ok(event),
      other => Err(other),
    }
  }

  fn original(input: &ExtractionEvent) -> OriginalEvent {
    OriginalEvent::Extraction(input.clone())
  }

  fn describe(input: &ExtractionEvent) -> &str {
    &input.candidate_id
  }

  async fn process(&self, input: &ExtractionEvent) -> Result<Option<Task>, EnrichError> {
    self.enrich(input).await.map(|()| None)
  }
}
