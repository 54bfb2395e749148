use anyhow::Result;
use cvingest::config::IngestConfig;

use super::print_json;

pub fn cmd_config(config: &IngestConfig) -> Result<()> {
  if let Some(path) = IngestConfig::user_config_path() {
    eprintln!("User config: {}", path.display());
  }
  print_json(config)
}
