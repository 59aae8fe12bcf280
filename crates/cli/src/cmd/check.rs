//! Implementation of the `extcheck` command.
//!
//! Loads a manifest, checks every external source, reports the outdated ones
//! and optionally writes the new versions back and commits them.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use serde::Serialize;

use extcheck_lib::{CheckerOptions, CheckerRegistry, ExternalState, ManifestChecker, SourceKind, State};

use crate::output::{OutputFormat, format_duration, print_error, print_json, print_outdated, print_success, symbols};
use crate::vcs;

/// Exit status bit: errors were recorded.
pub const EXIT_ERRORS: u8 = 1;
/// Exit status bit: outdated sources were found but not updated.
pub const EXIT_OUTDATED: u8 = 2;

#[derive(Debug)]
pub struct CheckArgs {
  pub manifest: PathBuf,
  pub filter_type: Option<SourceKind>,
  /// Write new versions back into the manifests.
  pub update: bool,
  /// Commit the rewritten manifests (only with `update`).
  pub commit: bool,
  pub check_outdated: bool,
  pub max_manifest_size: Option<u64>,
  pub require_important_update: bool,
  pub parallelism: Option<usize>,
  pub timeout: Option<Duration>,
  pub format: OutputFormat,
}

impl CheckArgs {
  fn options(&self) -> CheckerOptions {
    let defaults = CheckerOptions::default();
    CheckerOptions {
      max_manifest_size: self.max_manifest_size.unwrap_or(defaults.max_manifest_size),
      require_important_update: self.require_important_update,
      parallelism: self.parallelism.unwrap_or(defaults.parallelism).max(1),
      run_timeout: self.timeout,
      ..defaults
    }
  }
}

#[derive(Serialize)]
struct SourceReport {
  id: String,
  filename: String,
  state: State,
  new_version: Option<ExternalState>,
}

#[derive(Serialize)]
struct Report {
  outdated: Vec<SourceReport>,
  changes: Vec<String>,
  commit: Option<String>,
  errors: Vec<String>,
}

/// Execute the check, returning the process exit status.
pub async fn cmd_check(args: CheckArgs) -> Result<u8> {
  let start = Instant::now();
  let mut manifest = ManifestChecker::new(&args.manifest, args.options())
    .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;

  let registry = CheckerRegistry::with_defaults();
  manifest.check(&registry, args.filter_type).await;
  let outdated = manifest.outdated_external_data();

  let mut changes = Vec::new();
  let mut commit = None;
  let mut commit_error = None;
  if args.update && !outdated.is_empty() {
    changes = manifest.update_manifests();
    if args.commit && !changes.is_empty() {
      let dir = manifest.root_path().parent().unwrap_or(Path::new("."));
      match vcs::commit_changes(dir, &changes).await {
        Ok(branch) => commit = Some(branch),
        Err(e) => commit_error = Some(format!("{:#}", e)),
      }
    }
  }

  let mut errors: Vec<String> = manifest.errors().iter().map(|e| e.to_string()).collect();
  errors.extend(commit_error);

  if args.format.is_json() {
    let report = Report {
      outdated: outdated
        .iter()
        .map(|s| SourceReport {
          id: s.id().to_string(),
          filename: s.filename().to_string(),
          state: s.state(),
          new_version: s.new_version(),
        })
        .collect(),
      changes: changes.clone(),
      commit: commit.clone(),
      errors: errors.clone(),
    };
    print_json(&report)?;
  } else {
    for source in &outdated {
      print_outdated(source);
    }
    for change in &changes {
      println!("  {} {}", symbols::MODIFY.yellow(), change);
    }
    if let Some(branch) = &commit {
      print_success(&format!("Committed changes on branch {}", branch.cyan()));
    }
    for error in &errors {
      print_error(error);
    }
    if outdated.is_empty() && errors.is_empty() {
      print_success("All external sources are up to date.");
    }
    println!(
      "{} {} outdated, {} error(s) in {}",
      symbols::INFO.dimmed(),
      outdated.len(),
      errors.len(),
      format_duration(start.elapsed()).dimmed()
    );
  }

  Ok(exit_status(!errors.is_empty(), !outdated.is_empty(), !changes.is_empty(), args.check_outdated))
}

fn exit_status(has_errors: bool, has_outdated: bool, updated: bool, check_outdated: bool) -> u8 {
  let mut status = 0;
  if has_errors {
    status |= EXIT_ERRORS;
  }
  if check_outdated && has_outdated && !updated {
    status |= EXIT_OUTDATED;
  }
  status
}
