//! Shared consume loop for every pipeline stage
//!
//! The loop owns all queue traffic: the timed pop, forwarding the produced
//! task and writing dead letters. Stage implementations only turn one input
//! into an optional next task, so a stage failure can never be confused with
//! a store failure.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{StageQueues, WorkerStats};
use crate::{
  domain::event::{DeadLetterRecord, OriginalEvent, Stage, Task},
  queue::{QueueError, QueueStore},
};

#[async_trait]
pub(super) trait StageWorker: Send + Sync {
  type Input: Send + Sync;
  type Error: std::fmt::Display + Send;

  const STAGE: Stage;

  /// Pick this stage's variant out of a decoded task, handing back anything else
  fn accept(task: Task) -> Result<Self::Input, Task>;

  /// Typed copy of the input for the dead-letter record
  fn original(input: &Self::Input) -> OriginalEvent;

  /// Short label for logs
  fn describe(input: &Self::Input) -> &str;

  /// Returns the task to forward to the output queue, if any
  async fn process(&self, input: &Self::Input) -> Result<Option<Task>, Self::Error>;
}

/// Keep a wrong-but-decodable task typed so it stays replayable
fn misrouted(task: Task, payload: String) -> OriginalEvent {
  match task {
    Task::Detection(event) => OriginalEvent::Detection(event),
    Task::Extraction(event) => OriginalEvent::Extraction(event),
    Task::DeadLetter(_) => OriginalEvent::Unparsed { payload },
  }
}

async fn dead_letter(store: &dyn QueueStore, queue: &str, record: DeadLetterRecord) -> Result<(), QueueError> {
  store.push_task(queue, &Task::DeadLetter(record)).await
}

/// Consume `queues.input` until `cancel` fires or the store fails.
///
/// Cancellation is checked between pops, never during one, so a popped
/// payload is always handled.
pub(super) async fn run_stage<W: StageWorker>(
  worker: &W,
  worker_id: usize,
  store: &dyn QueueStore,
  queues: &StageQueues,
  cancel: &CancellationToken,
) -> Result<WorkerStats, QueueError> {
  let stage = W::STAGE;
  info!(%stage, worker_id, queue = %queues.input, "Worker started");
  let mut stats = WorkerStats::default();

  while !cancel.is_cancelled() {
    let payload = match store.pop(&queues.input, queues.pop_timeout).await {
      Ok(Some(payload)) => payload,
      Ok(None) => continue,
      Err(e) => {
        error!(%stage, worker_id, error = %e, "Queue store failed, stopping worker");
        return Err(e);
      }
    };
    stats.received += 1;

    let input = match Task::decode(&payload) {
      Ok(task) => match W::accept(task) {
        Ok(input) => input,
        Err(other) => {
          let kind = other.kind();
          error!(%stage, worker_id, kind, "Unexpected payload on queue");
          let record = DeadLetterRecord::new(
            stage,
            format!("unexpected payload: {} task on {} queue", kind, stage),
            misrouted(other, payload),
          );
          dead_letter(store, &queues.dead_letter, record).await?;
          stats.dead_lettered += 1;
          continue;
        }
      },
      Err(e) => {
        error!(%stage, worker_id, error = %e, "Undecodable payload on queue");
        let record = DeadLetterRecord::new(
          stage,
          format!("unexpected payload: {}", e),
          OriginalEvent::Unparsed { payload },
        );
        dead_letter(store, &queues.dead_letter, record).await?;
        stats.dead_lettered += 1;
        continue;
      }
    };

    trace!(%stage, worker_id, task = W::describe(&input), "Processing task");
    match worker.process(&input).await {
      Ok(next) => {
        if let (Some(task), Some(output)) = (next, &queues.output) {
          store.push_task(output, &task).await?;
        }
        stats.processed += 1;
        debug!(%stage, worker_id, task = W::describe(&input), "Task complete");
      }
      Err(e) => {
        warn!(%stage, worker_id, task = W::describe(&input), error = %e, "Task failed, dead-lettering");
        let record = DeadLetterRecord::new(stage, &e, W::original(&input));
        dead_letter(store, &queues.dead_letter, record).await?;
        stats.dead_lettered += 1;
      }
    }
  }

  info!(
    %stage,
    worker_id,
    received = stats.received,
    processed = stats.processed,
    dead_lettered = stats.dead_lettered,
    "Worker stopped"
  );
  Ok(stats)
}
