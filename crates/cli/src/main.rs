mod cmd;
mod output;
mod vcs;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use extcheck_lib::SourceKind;

use crate::output::OutputFormat;

/// extcheck - find and update stale external sources in build manifests
#[derive(Parser)]
#[command(name = "extcheck")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the application, module or sources manifest
  manifest: PathBuf,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,

  /// Update the manifests and commit the changes
  #[arg(long)]
  update: bool,

  /// Commit the changes without opening a change request
  #[arg(long, conflicts_with = "edit_only")]
  commit_only: bool,

  /// Update the manifests without committing
  #[arg(long)]
  edit_only: bool,

  /// Exit with status 2 when outdated sources were found but not updated
  #[arg(long)]
  check_outdated: bool,

  /// Only check sources of this type
  #[arg(long, value_enum)]
  filter_type: Option<FilterType>,

  /// Largest manifest file to read, in bytes
  #[arg(long)]
  max_manifest_size: Option<u64>,

  /// Only update when an important or main source changed
  #[arg(long)]
  require_important_update: bool,

  /// Maximum number of sources checked at once
  #[arg(long)]
  parallelism: Option<usize>,

  /// Give up on checks still running after this long (seconds, or e.g. "2m")
  #[arg(long, value_parser = parse_timeout)]
  timeout: Option<Duration>,

  /// Print the report as JSON
  #[arg(long)]
  json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterType {
  File,
  Archive,
  ExtraData,
  Git,
}

impl From<FilterType> for SourceKind {
  fn from(value: FilterType) -> Self {
    match value {
      FilterType::File => SourceKind::File,
      FilterType::Archive => SourceKind::Archive,
      FilterType::ExtraData => SourceKind::ExtraData,
      FilterType::Git => SourceKind::Git,
    }
  }
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
  match value.parse::<u64>() {
    Ok(secs) => Ok(Duration::from_secs(secs)),
    Err(_) => humantime::parse_duration(value).map_err(|e| e.to_string()),
  }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let args = cmd::CheckArgs {
    manifest: cli.manifest,
    filter_type: cli.filter_type.map(SourceKind::from),
    update: cli.update || cli.commit_only || cli.edit_only,
    commit: !cli.edit_only,
    check_outdated: cli.check_outdated,
    max_manifest_size: cli.max_manifest_size,
    require_important_update: cli.require_important_update,
    parallelism: cli.parallelism,
    timeout: cli.timeout,
    format: if cli.json { OutputFormat::Json } else { OutputFormat::Text },
  };

  let status = cmd::cmd_check(args).await?;
  Ok(ExitCode::from(status))
}
