//! Watch command - the long-running detection service

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use cvingest::{
  collab::{MemoryCandidateStore, PlainTextExtractor},
  config::{IngestConfig, StoreBackend},
  pipeline::{Extractor, Pipeline, StageQueues},
  watch::FileWatchService,
};
use tracing::{error, info, warn};

use super::{connect_store, require_shared_store, shutdown_token};

/// Watch the root until interrupted.
///
/// Processed signatures live in memory, so every restart re-detects files
/// once and relies on the store's dedup markers to drop repeats. On the memory
/// backend the detect queue only has a consumer with `--extract`, and the
/// extract queue never has one.
pub async fn cmd_watch(mut config: IngestConfig, root: Option<PathBuf>, poll: bool, extract: bool) -> Result<()> {
  if let Some(root) = root {
    config.watch.root = root;
  }
  config.watch.poll |= poll;
  if !extract {
    require_shared_store(&config.store, "watch")
      .map_err(|e| e.context("run `watch --extract` to consume detections in this process"))?;
  } else if config.store.backend == StoreBackend::Memory {
    warn!("Memory backend: extraction events stay on the in-process extract queue, no enricher consumes them");
  }
  let timeout = config.watch.shutdown_timeout();

  let store = connect_store(&config.store).await?;
  let cancel = shutdown_token();

  let service = FileWatchService::new(
    config.watch.clone(),
    store.clone(),
    Arc::new(MemoryCandidateStore::new()),
    config.queues.detect.clone(),
    &cancel,
  )
  .context("Failed to set up watch service")?;

  let pipeline_task = extract.then(|| {
    let extractor = Extractor::new(
      store.clone(),
      Arc::new(PlainTextExtractor::new()),
      StageQueues::extractor(&config.queues),
    )
    .with_root(service.root().to_path_buf());

    let mut pipeline = Pipeline::new(&cancel);
    pipeline.spawn_extractors(Arc::new(extractor), config.workers.extractors);

    // A failed pipeline takes the watcher down with it
    let cancel = cancel.clone();
    tokio::spawn(async move {
      let report = pipeline.run_until_cancelled(timeout).await;
      cancel.cancel();
      report
    })
  });

  let result = service.run_until_cancelled().await;
  cancel.cancel();
  if result.is_err() {
    service.stop(timeout).await;
  }

  if let Some(task) = pipeline_task {
    let report = task.await.context("Pipeline task panicked")?;
    if report.has_failures() {
      error!(errors = ?report.extractor.errors, "Extractor workers failed");
    }
    info!(
      extracted = report.extractor.totals.processed,
      dead_lettered = report.dead_lettered(),
      "Extraction stopped"
    );
  }

  let stats = result.context("Watch service failed")?;
  info!(
    notifications = stats.notifications,
    published = stats.published,
    duplicates = stats.duplicates,
    errors = stats.errors,
    "Watch finished"
  );
  Ok(())
}
