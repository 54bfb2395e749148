//! Dead-letter inspection and replay

use anyhow::{Context, Result};
use cvingest::{config::IngestConfig, pipeline::DeadLetters};

use super::{connect_store, print_json, require_shared_store};
use crate::DeadLetterCommand;

pub async fn cmd_dead_letters(config: IngestConfig, command: DeadLetterCommand) -> Result<()> {
  require_shared_store(&config.store, "dead-letters")?;
  let store = connect_store(&config.store).await?;
  let dead_letters = DeadLetters::new(store, config.queues.clone());

  let depth = dead_letters.depth().await.context("Failed to read dead-letter queue")?;
  eprintln!("{} entries on {}", depth, config.queues.dead_letter);

  match command {
    DeadLetterCommand::Peek { limit } => {
      let entries = dead_letters.peek(limit).await.context("Failed to peek dead letters")?;
      print_json(&entries)
    }
    DeadLetterCommand::Drain { limit } => {
      let entries = dead_letters.drain(limit).await.context("Failed to drain dead letters")?;
      print_json(&entries)
    }
    DeadLetterCommand::Replay { limit } => {
      let summary = dead_letters
        .replay_all(limit)
        .await
        .context("Failed to replay dead letters")?;
      print_json(&summary)
    }
  }
}
