//! Queue payloads exchanged between pipeline stages
//!
//! Every payload on a queue is a [`Task`] serialized as JSON with a `kind`
//! tag, so a stage can tell a detection from an extraction without guessing
//! from field names.

use std::{fmt, path::Path, time::UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// File Signature
// ============================================================================

/// Cheap fingerprint of a file's content state.
///
/// Two equal signatures mean the file did not change between observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSignature {
  /// Modification time in nanoseconds since the Unix epoch
  pub mtime_ns: i64,
  pub size_bytes: u64,
}

impl FileSignature {
  pub fn new(mtime_ns: i64, size_bytes: u64) -> Self {
    Self { mtime_ns, size_bytes }
  }

  pub fn from_metadata(meta: &std::fs::Metadata) -> std::io::Result<Self> {
    let modified = meta.modified()?;
    let mtime_ns = match modified.duration_since(UNIX_EPOCH) {
      Ok(after) => after.as_nanos() as i64,
      Err(before) => -(before.duration().as_nanos() as i64),
    };
    Ok(Self::new(mtime_ns, meta.len()))
  }

  /// Stat a file and compute its signature
  pub async fn of(path: &Path) -> std::io::Result<Self> {
    let meta = tokio::fs::metadata(path).await?;
    Self::from_metadata(&meta)
  }
}

impl fmt::Display for FileSignature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}|{}", self.mtime_ns, self.size_bytes)
  }
}

// ============================================================================
// Stage Events
// ============================================================================

/// Published by the watch service once a file is stable and authoritative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
  pub event_id: Uuid,
  pub detected_at: DateTime<Utc>,
  /// Absolute path on the watching host
  pub file_path: String,
  /// Path relative to the watched root, `/`-separated
  pub source_rel_path: String,
  /// First folder of the relative path, when there is one
  pub source_category: Option<String>,
  pub signature: FileSignature,
}

impl DetectionEvent {
  pub fn new(file_path: &Path, source_rel_path: String, signature: FileSignature) -> Self {
    let source_category = crate::domain::identity::source_category(&source_rel_path);
    Self {
      event_id: Uuid::new_v4(),
      detected_at: Utc::now(),
      file_path: file_path.to_string_lossy().to_string(),
      source_rel_path,
      source_category,
      signature,
    }
  }
}

/// Produced by an extractor: raw text plus the derived candidate id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionEvent {
  pub candidate_id: String,
  pub file_path: String,
  pub raw_text: String,
  pub source_category: Option<String>,
  pub source_rel_path: String,
  pub signature: FileSignature,
  /// Id of the detection this extraction came from
  pub event_id: Uuid,
  pub detected_at: DateTime<Utc>,
}

// ============================================================================
// Dead Letters
// ============================================================================

/// Pipeline stage that gave up on a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Extractor,
  Enricher,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Extractor => "extractor",
      Stage::Enricher => "enricher",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The task a dead letter was created for, kept whole for manual replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OriginalEvent {
  Detection(DetectionEvent),
  Extraction(ExtractionEvent),
  /// Payload that could not be decoded, or a variant the stage does not consume
  Unparsed { payload: String },
}

/// Terminal failure record pushed to the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
  pub stage: Stage,
  pub error: String,
  pub original_event: OriginalEvent,
  pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
  pub fn new(stage: Stage, error: impl fmt::Display, original_event: OriginalEvent) -> Self {
    Self {
      stage,
      error: error.to_string(),
      original_event,
      failed_at: Utc::now(),
    }
  }
}

// ============================================================================
// Queue Payload
// ============================================================================

/// Tagged payload carried on every queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
  Detection(DetectionEvent),
  Extraction(ExtractionEvent),
  DeadLetter(DeadLetterRecord),
}

impl Task {
  pub fn kind(&self) -> &'static str {
    match self {
      Task::Detection(_) => "detection",
      Task::Extraction(_) => "extraction",
      Task::DeadLetter(_) => "dead_letter",
    }
  }

  pub fn encode(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }

  pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(payload)
  }
}

impl From<DetectionEvent> for Task {
  fn from(event: DetectionEvent) -> Self {
    Task::Detection(event)
  }
}

impl From<ExtractionEvent> for Task {
  fn from(event: ExtractionEvent) -> Self {
    Task::Extraction(event)
  }
}

impl From<DeadLetterRecord> for Task {
  fn from(record: DeadLetterRecord) -> Self {
    Task::DeadLetter(record)
  }
}
