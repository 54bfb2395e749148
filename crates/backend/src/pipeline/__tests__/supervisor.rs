#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use tokio_util::sync::CancellationToken;

  use crate::{
    domain::{event::Task, identity::candidate_id},
    pipeline::{
      Extractor, Pipeline, StageQueues,
      __tests__::helpers::{BrokenStore, FakeText, PipelineTestContext, detection},
    },
  };

  #[tokio::test]
  async fn test_detection_flows_to_persistence() {
    let ctx = PipelineTestContext::new();
    let rels = ["Engineering/backend_engineer/cv.txt", "Sales/account_exec/cv.txt", "Ops/sre/corrupt.txt"];
    for rel in rels {
      ctx
        .push(&ctx.queues.detect, Task::Detection(detection(&format!("/inbox/{}", rel), rel)))
        .await;
    }

    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline::new(&cancel);
    pipeline
      .spawn_extractors(Arc::new(ctx.extractor()), 2)
      .spawn_enrichers(Arc::new(ctx.enricher()), 1);
    assert_eq!(pipeline.worker_count(), 3);

    ctx.wait_drained(&ctx.queues.detect).await;
    ctx.wait_drained(&ctx.queues.extract).await;

    let report = pipeline.shutdown(Duration::from_secs(2)).await;
    assert_eq!(report.extractor.workers, 2);
    assert_eq!(report.extractor.totals.received, 3);
    assert_eq!(report.extractor.totals.processed, 2);
    assert_eq!(report.extractor.totals.dead_lettered, 1);
    assert_eq!(report.enricher.totals.processed, 2);
    assert_eq!(report.dead_lettered(), 1);
    assert!(!report.has_failures());

    assert_eq!(ctx.candidates.inner.candidate_count(), 2);
    assert!(
      ctx
        .candidates
        .inner
        .candidate(&candidate_id("Sales/account_exec/cv.txt"))
        .is_some()
    );
  }

  #[tokio::test]
  async fn test_store_failure_stops_pipeline() {
    let ctx = PipelineTestContext::new();
    let broken = Arc::new(Extractor::new(
      Arc::new(BrokenStore),
      Arc::new(FakeText),
      StageQueues::extractor(&ctx.queues),
    ));

    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline::new(&cancel);
    pipeline
      .spawn_extractors(broken, 1)
      .spawn_enrichers(Arc::new(ctx.enricher()), 1);

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run_until_cancelled(Duration::from_secs(2)))
      .await
      .expect("pipeline should stop on its own");

    assert_eq!(report.extractor.failed, 1);
    assert!(report.extractor.errors[0].contains("connection refused"));
    assert_eq!(report.enricher.failed, 0);
    assert!(report.has_failures());
    assert!(!cancel.is_cancelled(), "parent token is left alone");
  }

  #[tokio::test]
  async fn test_parent_cancel_stops_workers() {
    let ctx = PipelineTestContext::new();
    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline::new(&cancel);
    pipeline.spawn_extractors(Arc::new(ctx.extractor()), 2);

    let runner = tokio::spawn(pipeline.run_until_cancelled(Duration::from_secs(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert_eq!(report.extractor.workers, 2);
    assert_eq!(report.extractor.timed_out, 0);
    assert!(!report.has_failures());
  }
}
