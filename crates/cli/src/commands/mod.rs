//! CLI command implementations

mod config;
mod dead_letters;
mod extract;
mod scan;
mod watch;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cvingest::{
  config::{StoreBackend, StoreConfig},
  queue::QueueStore,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::cmd_config;
pub use dead_letters::cmd_dead_letters;
pub use extract::cmd_extract;
pub use scan::cmd_scan;
pub use watch::cmd_watch;

async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn QueueStore>> {
  let store = <dyn QueueStore>::from_config(config)
    .await
    .context("Failed to connect to queue store")?;
  info!(backend = store.name(), "Connected to queue store");
  Ok(store)
}

/// Memory queues live and die with this process, so commands that talk to
/// other processes through the store need a shared backend
fn require_shared_store(config: &StoreConfig, command: &str) -> Result<()> {
  if config.backend == StoreBackend::Memory {
    bail!(
      "`{}` needs a shared queue store: the memory backend is private to this process. \
       Set `[store] backend = \"redis\"`",
      command
    );
  }
  Ok(())
}

/// Token cancelled on Ctrl-C
fn shutdown_token() -> CancellationToken {
  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Interrupt received, shutting down");
    }
    trigger.cancel();
  });
  cancel
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
