use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use cvingest::{
  collab::MemoryCandidateStore,
  config::{IngestConfig, StoreBackend},
  watch::FileWatchService,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{connect_store, print_json};

/// One reconciliation pass over the root, report on stdout
pub async fn cmd_scan(mut config: IngestConfig, root: Option<PathBuf>) -> Result<()> {
  if let Some(root) = root {
    config.watch.root = root;
  }

  if config.store.backend == StoreBackend::Memory {
    warn!("Memory backend: the report is a dry run, published detections are dropped on exit");
  }
  let store = connect_store(&config.store).await?;
  let cancel = CancellationToken::new();
  let service = FileWatchService::new(
    config.watch.clone(),
    store,
    Arc::new(MemoryCandidateStore::new()),
    config.queues.detect.clone(),
    &cancel,
  )
  .context("Failed to set up watch service")?;

  let report = service.reconcile_once().await.context("Reconciliation failed")?;
  cancel.cancel();
  print_json(&report)
}
