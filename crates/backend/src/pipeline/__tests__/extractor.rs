#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;

  use crate::{
    domain::{
      event::{OriginalEvent, Stage, Task},
      identity::candidate_id,
    },
    pipeline::__tests__::helpers::{BrokenStore, PipelineTestContext, detection, extraction, run_until_drained},
    queue::{QueueError, QueueStore},
  };

  #[tokio::test]
  async fn test_failed_task_is_dead_lettered_and_next_succeeds() {
    let ctx = PipelineTestContext::new();
    let bad = detection("/inbox/Engineering/qa/corrupt.pptx", "Engineering/qa/corrupt.pptx");
    let good = detection("/inbox/Engineering/backend_engineer/cv.txt", "Engineering/backend_engineer/cv.txt");
    ctx.push(&ctx.queues.detect, Task::Detection(bad.clone())).await;
    ctx.push(&ctx.queues.detect, Task::Detection(good.clone())).await;

    let extractor = Arc::new(ctx.extractor());
    let stats = run_until_drained(&ctx, &ctx.queues.detect, |cancel| async move {
      extractor.run(0, &cancel).await
    })
    .await;

    assert_eq!(stats.received, 2);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.dead_lettered, 1);

    let dead = ctx.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stage, Stage::Extractor);
    assert!(dead[0].error.contains("cannot parse"), "{}", dead[0].error);
    assert_eq!(dead[0].original_event, OriginalEvent::Detection(bad));

    let extracted = ctx.extractions();
    assert_eq!(extracted.len(), 1);
    assert_eq!(extracted[0].candidate_id, candidate_id("Engineering/backend_engineer/cv.txt"));
    assert_eq!(extracted[0].source_category.as_deref(), Some("Engineering"));
    assert_eq!(extracted[0].signature, good.signature);
    assert_eq!(extracted[0].event_id, good.event_id);
  }

  #[tokio::test]
  async fn test_wrong_variant_is_dead_lettered_typed() {
    let ctx = PipelineTestContext::new();
    let misrouted = extraction("Sales/lead/cv.txt", "text");
    ctx.push(&ctx.queues.detect, Task::Extraction(misrouted.clone())).await;

    let extractor = Arc::new(ctx.extractor());
    let stats = run_until_drained(&ctx, &ctx.queues.detect, |cancel| async move {
      extractor.run(0, &cancel).await
    })
    .await;

    assert_eq!(stats.dead_lettered, 1);
    let dead = ctx.dead_letters();
    assert!(dead[0].error.starts_with("unexpected payload"), "{}", dead[0].error);
    assert_eq!(dead[0].original_event, OriginalEvent::Extraction(misrouted));
    assert!(ctx.extractions().is_empty());
  }

  #[tokio::test]
  async fn test_garbage_payload_is_kept_raw() {
    let ctx = PipelineTestContext::new();
    ctx.store.push(&ctx.queues.detect, "{not json".to_string()).await.unwrap();

    let extractor = Arc::new(ctx.extractor());
    run_until_drained(&ctx, &ctx.queues.detect, |cancel| async move {
      extractor.run(0, &cancel).await
    })
    .await;

    let dead = ctx.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(
      dead[0].original_event,
      OriginalEvent::Unparsed {
        payload: "{not json".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_store_failure_ends_worker() {
    let ctx = PipelineTestContext::new();
    let extractor = crate::pipeline::Extractor::new(
      Arc::new(BrokenStore),
      Arc::new(crate::pipeline::__tests__::helpers::FakeText),
      crate::pipeline::StageQueues::extractor(&ctx.queues),
    );

    let cancel = tokio_util::sync::CancellationToken::new();
    let result = extractor.run(0, &cancel).await;
    assert!(matches!(result, Err(QueueError::Unavailable(_))));
  }

  #[tokio::test]
  async fn test_competing_workers_process_each_task_once() {
    let ctx = PipelineTestContext::new();
    for i in 0..12 {
      let rel = format!("Engineering/dev_{}/cv.txt", i);
      ctx
        .push(&ctx.queues.detect, Task::Detection(detection(&format!("/inbox/{}", rel), &rel)))
        .await;
    }

    let extractor = Arc::new(ctx.extractor());
    let cancel = tokio_util::sync::CancellationToken::new();
    let handles: Vec<_> = (0..3)
      .map(|id| {
        let extractor = extractor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { extractor.run(id, &cancel).await })
      })
      .collect();

    ctx.wait_drained(&ctx.queues.detect).await;
    cancel.cancel();

    let mut processed = 0;
    for handle in handles {
      processed += handle.await.unwrap().unwrap().processed;
    }
    assert_eq!(processed, 12);
    assert_eq!(ctx.extractions().len(), 12);
  }
}
