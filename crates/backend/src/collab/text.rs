// Plain-text extractor for deployments without a document converter
//
// Reads .txt/.md with lossy UTF-8 decoding. Anything else is refused so the
// extractor dead-letters it instead of guessing.

use std::path::Path;

use async_trait::async_trait;
use tracing::trace;

use super::{CollaboratorError, TextExtractor};

const DEFAULT_EXTENSIONS: &[&str] = &["txt", "md"];

#[derive(Debug, Clone)]
pub struct PlainTextExtractor {
  extensions: Vec<String>,
}

impl Default for PlainTextExtractor {
  fn default() -> Self {
    Self {
      extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
    }
  }
}

impl PlainTextExtractor {
  pub fn new() -> Self {
    Self::default()
  }

  fn supports(&self, path: &Path) -> bool {
    path
      .extension()
      .map(|ext| ext.to_string_lossy().to_lowercase())
      .is_some_and(|ext| self.extensions.contains(&ext))
  }
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
  async fn extract_text(&self, path: &Path) -> Result<String, CollaboratorError> {
    if !self.supports(path) {
      return Err(CollaboratorError::UnsupportedFormat(path.display().to_string()));
    }

    let bytes = tokio::fs::read(path).await.map_err(|source| CollaboratorError::Io {
      path: path.display().to_string(),
      source,
    })?;

    trace!(path = %path.display(), bytes = bytes.len(), "Read plain-text CV");
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }
}
