//! Contracts for the services the pipeline drives but does not own
//!
//! Format-specific text extraction, LLM structured extraction, embeddings and
//! persistence are all reached through the traits below. Workers hold them as
//! `Arc<dyn _>` so any number of worker instances can share one client.

mod memory;
mod text;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::{memory::MemoryCandidateStore, text::PlainTextExtractor};
use crate::domain::event::FileSignature;

// ============================================================================
// Extraction
// ============================================================================

/// Turns a CV file into plain text
#[async_trait]
pub trait TextExtractor: Send + Sync {
  async fn extract_text(&self, path: &std::path::Path) -> Result<String, CollaboratorError>;
}

/// Folder context handed to the structured extractor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionHint {
  pub source_category: Option<String>,
  pub role_folder: Option<String>,
}

/// LLM-backed extraction of a structured candidate document from raw text
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
  async fn extract(&self, text: &str, hint: &ExtractionHint) -> Result<serde_json::Value, CollaboratorError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
  fn name(&self) -> &str;
  fn dimensions(&self) -> usize;

  async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;
}

// ============================================================================
// Persistence
// ============================================================================

/// Everything the enricher writes for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDocument {
  pub candidate_id: String,
  pub source_rel_path: String,
  pub source_category: Option<String>,
  pub file_path: String,
  pub structured: serde_json::Value,
  pub raw_text: String,
  pub signature: FileSignature,
  pub detected_at: DateTime<Utc>,
  pub enriched_at: DateTime<Utc>,
}

/// Read side used by reconciliation: last processed signature per relative path
#[async_trait]
pub trait SignatureLookup: Send + Sync {
  /// Paths with no record are absent from the result
  async fn last_signatures(&self, rel_paths: &[String]) -> Result<HashMap<String, FileSignature>, CollaboratorError>;
}

#[async_trait]
pub trait CandidateStore: SignatureLookup {
  async fn begin(&self) -> Result<Box<dyn CandidateTransaction>, CollaboratorError>;

  /// Remember which signature of `rel_path` was last enriched
  async fn record_signature(&self, rel_path: &str, signature: FileSignature) -> Result<(), CollaboratorError>;
}

/// Writes inside one transaction; nothing is visible before `commit`
#[async_trait]
pub trait CandidateTransaction: Send {
  async fn upsert_candidate(&mut self, document: &CandidateDocument) -> Result<(), CollaboratorError>;
  async fn upsert_embedding(&mut self, candidate_id: &str, embedding: &[f32]) -> Result<(), CollaboratorError>;
  async fn commit(self: Box<Self>) -> Result<(), CollaboratorError>;
  async fn rollback(self: Box<Self>) -> Result<(), CollaboratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
  #[error("Unsupported format: {0}")]
  UnsupportedFormat(String),
  #[error("Failed to read {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Service error: {0}")]
  Service(String),
  #[error("Invalid output: {0}")]
  InvalidOutput(String),
  #[error("Storage error: {0}")]
  Storage(String),
}
