//! In-process candidate store
//!
//! Transactions buffer their writes and apply them under one lock on commit,
//! so a rolled-back enrichment leaves no trace.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{CandidateDocument, CandidateStore, CandidateTransaction, CollaboratorError, SignatureLookup};
use crate::domain::{event::FileSignature, identity::normalize_rel_path};

#[derive(Debug, Default)]
struct State {
  candidates: HashMap<String, CandidateDocument>,
  embeddings: HashMap<String, Vec<f32>>,
  signatures: HashMap<String, FileSignature>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCandidateStore {
  state: Arc<Mutex<State>>,
}

impl MemoryCandidateStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>, CollaboratorError> {
    lock_state(&self.state)
  }

  pub fn candidate(&self, candidate_id: &str) -> Option<CandidateDocument> {
    self.lock().ok()?.candidates.get(candidate_id).cloned()
  }

  pub fn embedding(&self, candidate_id: &str) -> Option<Vec<f32>> {
    self.lock().ok()?.embeddings.get(candidate_id).cloned()
  }

  pub fn candidate_count(&self) -> usize {
    self.lock().map(|state| state.candidates.len()).unwrap_or_default()
  }
}

fn lock_state(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, CollaboratorError> {
  state
    .lock()
    .map_err(|_| CollaboratorError::Storage("candidate store lock poisoned".to_string()))
}

#[async_trait]
impl SignatureLookup for MemoryCandidateStore {
  async fn last_signatures(&self, rel_paths: &[String]) -> Result<HashMap<String, FileSignature>, CollaboratorError> {
    let state = self.lock()?;
    Ok(
      rel_paths
        .iter()
        .filter_map(|rel| state.signatures.get(&normalize_rel_path(rel)).map(|sig| (rel.clone(), *sig)))
        .collect(),
    )
  }
}

#[async_trait]
impl CandidateStore for MemoryCandidateStore {
  async fn begin(&self) -> Result<Box<dyn CandidateTransaction>, CollaboratorError> {
    Ok(Box::new(MemoryTransaction {
      state: self.state.clone(),
      candidates: Vec::new(),
      embeddings: Vec::new(),
    }))
  }

  async fn record_signature(&self, rel_path: &str, signature: FileSignature) -> Result<(), CollaboratorError> {
    self.lock()?.signatures.insert(normalize_rel_path(rel_path), signature);
    Ok(())
  }
}

struct MemoryTransaction {
  state: Arc<Mutex<State>>,
  candidates: Vec<CandidateDocument>,
  embeddings: Vec<(String, Vec<f32>)>,
}

#[async_trait]
impl CandidateTransaction for MemoryTransaction {
  async fn upsert_candidate(&mut self, document: &CandidateDocument) -> Result<(), CollaboratorError> {
    self.candidates.push(document.clone());
    Ok(())
  }

  async fn upsert_embedding(&mut self, candidate_id: &str, embedding: &[f32]) -> Result<(), CollaboratorError> {
    self.embeddings.push((candidate_id.to_string(), embedding.to_vec()));
    Ok(())
  }

  async fn commit(self: Box<Self>) -> Result<(), CollaboratorError> {
    let this = *self;
    let mut state = lock_state(&this.state)?;
    for document in this.candidates {
      state.candidates.insert(document.candidate_id.clone(), document);
    }
    for (candidate_id, embedding) in this.embeddings {
      state.embeddings.insert(candidate_id, embedding);
    }
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<(), CollaboratorError> {
    Ok(())
  }
}
