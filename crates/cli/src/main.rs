//! cvingest CLI - watch a shared CV folder and feed the extraction pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cvingest::config::IngestConfig;
use std::path::PathBuf;

mod commands;
mod logging;

use commands::{cmd_config, cmd_dead_letters, cmd_extract, cmd_scan, cmd_watch};
use logging::{init_cli_logging, init_logging};

#[derive(Parser)]
#[command(name = "cvingest")]
#[command(about = "Detect new candidate CVs in a shared folder and queue them for extraction")]
#[command(after_help = "\
QUICK START:
  cvingest config                 # Show the effective configuration
  cvingest watch --extract        # Watch the root and extract in-process
  cvingest scan                   # One reconciliation pass, then exit

OPERATIONS:
  cvingest extract                # Run extractor workers against the store
  cvingest dead-letters peek      # Inspect failed tasks
  cvingest dead-letters replay    # Push failed tasks back onto their queue")]
struct Cli {
  /// Config file (default: $XDG_CONFIG_HOME/cvingest/config.toml)
  #[arg(long, short, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Watch the CV root and publish detections
  Watch {
    /// Override the configured root folder
    #[arg(long)]
    root: Option<PathBuf>,
    /// Use the polling backend instead of native notifications
    #[arg(long)]
    poll: bool,
    /// Also run extractor workers in this process
    #[arg(long)]
    extract: bool,
  },
  /// Run a single reconciliation scan and print the report
  Scan {
    /// Override the configured root folder
    #[arg(long)]
    root: Option<PathBuf>,
  },
  /// Run extractor workers until interrupted
  Extract {
    /// Number of workers (default: workers.extractors)
    #[arg(long, short)]
    workers: Option<usize>,
    /// Root used to derive relative paths for events that lack one
    #[arg(long)]
    root: Option<PathBuf>,
  },
  /// Inspect or replay the dead-letter queue
  #[command(name = "dead-letters")]
  DeadLetters {
    #[command(subcommand)]
    command: DeadLetterCommand,
  },
  /// Print the effective configuration as JSON
  Config,
}

/// Subcommands for `cvingest dead-letters`
#[derive(Subcommand)]
pub enum DeadLetterCommand {
  /// Show entries without removing them
  Peek {
    #[arg(long, short, default_value_t = 20)]
    limit: usize,
  },
  /// Remove entries and print them
  Drain {
    #[arg(long, short, default_value_t = 20)]
    limit: usize,
  },
  /// Push entries back onto the queue of the stage that failed them
  Replay {
    #[arg(long, short, default_value_t = 100)]
    limit: usize,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let config = IngestConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

  match cli.command {
    Commands::Watch { root, poll, extract } => {
      let _guard = init_logging(&config.logging);
      cmd_watch(config, root, poll, extract).await
    }
    Commands::Scan { root } => {
      init_cli_logging(&config.logging);
      cmd_scan(config, root).await
    }
    Commands::Extract { workers, root } => {
      let _guard = init_logging(&config.logging);
      cmd_extract(config, workers, root).await
    }
    Commands::DeadLetters { command } => {
      init_cli_logging(&config.logging);
      cmd_dead_letters(config, command).await
    }
    Commands::Config => cmd_config(&config),
  }
}
