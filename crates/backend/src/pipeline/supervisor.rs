//! Pipeline supervisor - owns the worker tasks of both stages
//!
//! All workers share one child cancellation token. A worker that ends with
//! a store error is the only thing that brings the whole pipeline down.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
  task::{Id, JoinError, JoinSet},
  time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Enricher, Extractor, WorkerStats};
use crate::{domain::event::Stage, queue::QueueError};

type WorkerResult = Result<WorkerStats, QueueError>;

/// Totals for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
  pub workers: usize,
  pub totals: WorkerStats,
  /// Workers that ended with a store error or panicked
  pub failed: usize,
  /// Workers still running when the shutdown timeout expired
  pub timed_out: usize,
  pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
  pub extractor: StageReport,
  pub enricher: StageReport,
}

impl PipelineReport {
  fn stage_mut(&mut self, stage: Stage) -> &mut StageReport {
    match stage {
      Stage::Extractor => &mut self.extractor,
      Stage::Enricher => &mut self.enricher,
    }
  }

  pub fn has_failures(&self) -> bool {
    self.extractor.failed + self.enricher.failed > 0
  }

  pub fn dead_lettered(&self) -> u64 {
    self.extractor.totals.dead_lettered + self.enricher.totals.dead_lettered
  }
}

pub struct Pipeline {
  cancel: CancellationToken,
  workers: JoinSet<WorkerResult>,
  stages: HashMap<Id, Stage>,
  report: PipelineReport,
}

impl Pipeline {
  pub fn new(cancel: &CancellationToken) -> Self {
    Self {
      cancel: cancel.child_token(),
      workers: JoinSet::new(),
      stages: HashMap::new(),
      report: PipelineReport::default(),
    }
  }

  pub fn spawn_extractors(&mut self, extractor: Arc<Extractor>, count: usize) -> &mut Self {
    for worker_id in 0..count {
      let extractor = extractor.clone();
      let cancel = self.cancel.clone();
      let handle = self.workers.spawn(async move { extractor.run(worker_id, &cancel).await });
      self.stages.insert(handle.id(), Stage::Extractor);
    }
    self.report.extractor.workers += count;
    info!(count, "Spawned extractor workers");
    self
  }

  pub fn spawn_enrichers(&mut self, enricher: Arc<Enricher>, count: usize) -> &mut Self {
    for worker_id in 0..count {
      let enricher = enricher.clone();
      let cancel = self.cancel.clone();
      let handle = self.workers.spawn(async move { enricher.run(worker_id, &cancel).await });
      self.stages.insert(handle.id(), Stage::Enricher);
    }
    self.report.enricher.workers += count;
    info!(count, "Spawned enricher workers");
    self
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }

  /// Fold one finished worker into the report. Returns false if it failed.
  fn record(&mut self, joined: Result<(Id, WorkerResult), JoinError>) -> bool {
    let (id, result) = match joined {
      Ok((id, result)) => (id, Ok(result)),
      Err(e) => (e.id(), Err(e)),
    };
    let stage = self.stages.remove(&id).unwrap_or(Stage::Extractor);
    let report = self.report.stage_mut(stage);

    match result {
      Ok(Ok(stats)) => {
        report.totals += stats;
        true
      }
      Ok(Err(e)) => {
        report.failed += 1;
        report.errors.push(e.to_string());
        false
      }
      Err(e) if e.is_cancelled() => {
        report.timed_out += 1;
        false
      }
      Err(e) => {
        warn!(%stage, error = %e, "Worker task panicked");
        report.failed += 1;
        report.errors.push(e.to_string());
        false
      }
    }
  }

  /// Run until the parent token fires or a worker fails, then shut down
  pub async fn run_until_cancelled(mut self, timeout: Duration) -> PipelineReport {
    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => break,

        joined = self.workers.join_next_with_id() => match joined {
          Some(joined) => {
            if !self.record(joined) {
              error!("Worker failed, shutting the pipeline down");
              break;
            }
          }
          None => break,
        }
      }
    }

    self.shutdown(timeout).await
  }

  /// Cancel every worker and wait up to `timeout` for them to finish
  pub async fn shutdown(mut self, timeout: Duration) -> PipelineReport {
    self.cancel.cancel();
    let deadline = Instant::now() + timeout;

    loop {
      match tokio::time::timeout_at(deadline, self.workers.join_next_with_id()).await {
        Ok(Some(joined)) => {
          self.record(joined);
        }
        Ok(None) => break,
        Err(_) => {
          warn!(remaining = self.workers.len(), "Workers did not stop in time, aborting");
          self.workers.abort_all();
          while let Some(joined) = self.workers.join_next_with_id().await {
            self.record(joined);
          }
          break;
        }
      }
    }

    info!(
      extracted = self.report.extractor.totals.processed,
      enriched = self.report.enricher.totals.processed,
      dead_lettered = self.report.dead_lettered(),
      "Pipeline stopped"
    );
    self.report
  }
}
