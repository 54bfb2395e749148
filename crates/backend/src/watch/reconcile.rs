//! Reconciliation - the periodic full scan that backs up live notifications
//!
//! Scans the root, keeps one winner per candidate folder and compares each
//! winner's signature with the last one the persistence layer processed.
//! Only changed winners go through stability, arbitration, dedup and publish.
//! If the signature lookup fails the pass is skipped entirely; the next
//! interval tries again.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use futures::{StreamExt, stream};
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use super::{WatchError, service::PathOutcome, service::WatchCore};
use crate::{
  domain::{event::FileSignature, identity::rel_path},
  queue::QueueError,
  selection::FileFilter,
};

/// Tally of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
  /// Files under the root that passed the name filter
  pub scanned: usize,
  /// Winners after arbitration, one per candidate folder
  pub candidates: usize,
  /// Winners whose signature matched the recorded one
  pub unchanged: usize,
  pub published: usize,
  pub duplicates: usize,
  pub superseded: usize,
  pub restabilizing: usize,
  pub vanished: usize,
  pub ignored: usize,
  pub errors: usize,
  /// The signature lookup failed and the pass was skipped
  pub lookup_failed: bool,
}

impl ReconcileReport {
  fn record(&mut self, outcome: &PathOutcome) {
    match outcome {
      PathOutcome::Ignored => self.ignored += 1,
      PathOutcome::Vanished => self.vanished += 1,
      PathOutcome::Restabilizing => self.restabilizing += 1,
      PathOutcome::Superseded => self.superseded += 1,
      PathOutcome::Duplicate => self.duplicates += 1,
      PathOutcome::Published(_) => self.published += 1,
    }
  }
}

/// Every regular file below `root` whose name passes the filter
pub(crate) fn scan_files(root: &Path, filter: &FileFilter) -> Vec<PathBuf> {
  WalkDir::new(root)
    .follow_links(false)
    .into_iter()
    .filter_map(|entry| match entry {
      Ok(entry) => Some(entry),
      Err(e) => {
        trace!(error = %e, "Skipping unreadable entry");
        None
      }
    })
    .filter(|entry| entry.file_type().is_file())
    .map(|entry| entry.into_path())
    .filter(|path| filter.matches_name(path))
    .collect()
}

impl WatchCore {
  pub(super) async fn reconcile_once(self: &Arc<Self>) -> Result<ReconcileReport, WatchError> {
    let mut report = ReconcileReport::default();

    let selector = self.selector.clone();
    let (scanned, winners) = tokio::task::spawn_blocking(move || {
      let files = scan_files(selector.root(), selector.filter());
      (files.len(), selector.select_latest(&files))
    })
    .await?;

    report.scanned = scanned;
    report.candidates = winners.len();
    if winners.is_empty() {
      debug!(scanned, "Reconciliation found no candidates");
      return Ok(report);
    }

    let root = self.selector.root();
    let winners: Vec<(String, PathBuf)> = winners
      .into_values()
      .filter_map(|path| rel_path(&path, root).map(|rel| (rel, path)))
      .collect();
    let rels: Vec<String> = winners.iter().map(|(rel, _)| rel.clone()).collect();

    let recorded = match self.signatures.last_signatures(&rels).await {
      Ok(recorded) => recorded,
      Err(e) => {
        warn!(error = %e, candidates = report.candidates, "Signature lookup failed, skipping reconciliation pass");
        report.lookup_failed = true;
        return Ok(report);
      }
    };

    let mut changed = Vec::new();
    for (rel, path) in winners {
      match FileSignature::of(&path).await {
        Ok(current) if recorded.get(&rel) == Some(&current) => {
          trace!(rel = %rel, "Unchanged since last processed");
          report.unchanged += 1;
        }
        Ok(_) => changed.push(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.vanished += 1,
        Err(e) => {
          debug!(path = %path.display(), error = %e, "Stat failed during reconciliation");
          report.errors += 1;
        }
      }
    }

    let concurrency = self.config.reconcile_concurrency.max(1);
    let outcomes: Vec<Result<PathOutcome, WatchError>> = stream::iter(changed)
      .map(|path| {
        let core = self.clone();
        async move { core.process_path(&path).await }
      })
      .buffer_unordered(concurrency)
      .collect()
      .await;

    let mut store_error: Option<QueueError> = None;
    for outcome in outcomes {
      match outcome {
        Ok(outcome) => report.record(&outcome),
        Err(WatchError::Queue(e)) => {
          report.errors += 1;
          store_error.get_or_insert(e);
        }
        Err(e) => {
          debug!(error = %e, "Path failed during reconciliation");
          report.errors += 1;
        }
      }
    }

    if let Some(e) = store_error {
      warn!(errors = report.errors, "Queue store failed during reconciliation");
      return Err(e.into());
    }

    info!(
      scanned = report.scanned,
      candidates = report.candidates,
      unchanged = report.unchanged,
      published = report.published,
      duplicates = report.duplicates,
      "Reconciliation pass complete"
    );
    Ok(report)
  }
}
