//! Extract command - standalone extractor workers

use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, bail};
use cvingest::{
  collab::PlainTextExtractor,
  config::IngestConfig,
  pipeline::{Extractor, Pipeline, StageQueues},
};
use tracing::info;

use super::{connect_store, print_json, require_shared_store, shutdown_token};

pub async fn cmd_extract(config: IngestConfig, workers: Option<usize>, root: Option<PathBuf>) -> Result<()> {
  require_shared_store(&config.store, "extract")?;
  let workers = workers.unwrap_or(config.workers.extractors).max(1);
  let root = root.unwrap_or_else(|| config.watch.root.clone());

  let store = connect_store(&config.store).await?;
  let cancel = shutdown_token();

  let extractor = Extractor::new(
    store,
    Arc::new(PlainTextExtractor::new()),
    StageQueues::extractor(&config.queues),
  )
  .with_root(root);

  let mut pipeline = Pipeline::new(&cancel);
  pipeline.spawn_extractors(Arc::new(extractor), workers);
  info!(workers, queue = %config.queues.detect, "Extracting until interrupted");

  let report = pipeline.run_until_cancelled(config.watch.shutdown_timeout()).await;
  print_json(&report)?;

  if report.has_failures() {
    bail!("{} extractor worker(s) failed", report.extractor.failed);
  }
  Ok(())
}
