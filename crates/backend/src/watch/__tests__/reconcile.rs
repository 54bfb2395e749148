#[cfg(test)]
mod tests {
  use std::{sync::atomic::Ordering, time::Duration};

  use pretty_assertions::assert_eq;

  use crate::watch::{ReconcileReport, __tests__::helpers::WatchTestContext};

  #[tokio::test]
  async fn test_empty_root_produces_nothing() {
    let ctx = WatchTestContext::new();
    let report = ctx.service().reconcile_once().await.expect("reconcile");

    assert_eq!(report, ReconcileReport::default());
    assert!(ctx.detections().is_empty());
  }

  #[tokio::test]
  async fn test_publishes_one_winner_per_candidate() {
    let ctx = WatchTestContext::new();
    ctx.write("Engineering/backend_engineer/cv.txt", "Jane");
    ctx.write("Engineering/frontend_engineer/cv.pptx", "John");
    ctx.write("Engineering/frontend_engineer/~$cv.pptx", "lock");

    let report = ctx.service().reconcile_once().await.expect("reconcile");
    assert_eq!(report.scanned, 2);
    assert_eq!(report.candidates, 2);
    assert_eq!(report.published, 2);

    let mut rels: Vec<String> = ctx.detections().into_iter().map(|e| e.source_rel_path).collect();
    rels.sort();
    assert_eq!(
      rels,
      vec![
        "Engineering/backend_engineer/cv.txt".to_string(),
        "Engineering/frontend_engineer/cv.pptx".to_string(),
      ]
    );
  }

  #[tokio::test]
  async fn test_non_archived_wins_regardless_of_age() {
    let ctx = WatchTestContext::new();
    ctx.write_aged("Design/ux/cv.pptx", "current", Duration::from_secs(7 * 24 * 3600));
    ctx.write("Design/ux/cv_backup.pptx", "backup saved later");
    ctx.write("Design/ux/old cv.pptx", "older still");

    let report = ctx.service().reconcile_once().await.expect("reconcile");
    assert_eq!(report.scanned, 3);
    assert_eq!(report.candidates, 1);
    assert_eq!(report.published, 1);

    let detections = ctx.detections();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].source_rel_path, "Design/ux/cv.pptx");
  }

  #[tokio::test]
  async fn test_unchanged_files_are_skipped() {
    let ctx = WatchTestContext::new();
    let processed = ctx.write("Engineering/backend_engineer/cv.txt", "Jane");
    ctx.record_processed(&processed, "Engineering/backend_engineer/cv.txt").await;
    ctx.write("Sales/account_exec/cv.txt", "Sam");

    let report = ctx.service().reconcile_once().await.expect("reconcile");
    assert_eq!(report.candidates, 2);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.published, 1);
    assert_eq!(ctx.detections()[0].source_rel_path, "Sales/account_exec/cv.txt");
  }

  #[tokio::test]
  async fn test_failing_lookup_skips_pass() {
    let ctx = WatchTestContext::new();
    ctx.write("Engineering/backend_engineer/cv.txt", "Jane");
    ctx.signatures.failing.store(true, Ordering::SeqCst);

    let service = ctx.service();
    let report = service.reconcile_once().await.expect("lookup failure is not fatal");
    assert!(report.lookup_failed);
    assert_eq!(report.published, 0);
    assert!(ctx.detections().is_empty());

    // Next pass retries once the lookup recovers
    ctx.signatures.failing.store(false, Ordering::SeqCst);
    let report = service.reconcile_once().await.expect("reconcile");
    assert!(!report.lookup_failed);
    assert_eq!(report.published, 1);
  }

  #[tokio::test]
  async fn test_second_pass_deduplicates() {
    let ctx = WatchTestContext::new();
    ctx.write("Engineering/backend_engineer/cv.txt", "Jane");
    let service = ctx.service();

    assert_eq!(service.reconcile_once().await.unwrap().published, 1);
    let second = service.reconcile_once().await.unwrap();
    assert_eq!(second.published, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(ctx.detections().len(), 1);
  }

  #[tokio::test]
  async fn test_failed_push_is_retried_by_next_pass() {
    let ctx = WatchTestContext::new();
    ctx.write("Engineering/backend_engineer/cv.txt", "Jane");
    let store = ctx.gated();
    store.failing_pushes.store(1, Ordering::SeqCst);
    let service = ctx.service_with(store);

    assert!(service.reconcile_once().await.is_err(), "store failure is a hard error");
    assert!(ctx.detections().is_empty());

    let retry = service.reconcile_once().await.expect("reconcile");
    assert_eq!(retry.published, 1);
    assert_eq!(retry.duplicates, 0);
    assert_eq!(ctx.detections().len(), 1);
  }
}
