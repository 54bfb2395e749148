//! Logging setup for the CLI

use cvingest::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "cvingest.log";

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
  EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.log_level).into())
    .from_env_lossy()
}

/// Console logging on stderr, so command output on stdout stays parseable
pub fn init_cli_logging(config: &LoggingConfig) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(config))
    .with_writer(std::io::stderr)
    .init();
}

/// Initialize logging for the long-running commands.
///
/// Logs go to a rolling file when `log_dir` is set, to the console otherwise.
/// Returns the guard that must be kept alive for the duration of the program.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
  let Some(log_dir) = &config.log_dir else {
    init_cli_logging(config);
    return None;
  };

  if let Err(e) = std::fs::create_dir_all(log_dir) {
    init_cli_logging(config);
    tracing::warn!(dir = %log_dir.display(), error = %e, "Cannot create log directory, logging to console");
    return None;
  }

  let file_appender = match config.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(log_dir, LOG_FILE),
  };
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter(config))
    .with_writer(non_blocking)
    .with_ansi(false)
    .with_target(true)
    .init();

  Some(guard)
}
