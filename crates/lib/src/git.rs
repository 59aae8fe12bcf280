//! Thin wrapper around `git ls-remote`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
  #[error("failed to run git: {source}")]
  Spawn {
    #[source]
    source: std::io::Error,
  },

  #[error("git ls-remote {url} failed: {stderr}")]
  Failed { url: String, stderr: String },

  #[error("git ls-remote {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },
}

/// List the refs of a remote repository as `ref name -> commit`.
///
/// `patterns` narrows the refs the same way `git ls-remote <url> <patterns>` does.
pub async fn ls_remote(url: &str, patterns: &[&str], timeout: Duration) -> Result<BTreeMap<String, String>, GitError> {
  debug!(url = %url, ?patterns, "listing remote refs");

  let mut command = Command::new("git");
  command
    .arg("ls-remote")
    .arg("--")
    .arg(url)
    .args(patterns)
    .env("GIT_TERMINAL_PROMPT", "0")
    .env("GIT_ASKPASS", "true")
    .stdin(Stdio::null())
    .kill_on_drop(true);

  let output = tokio::time::timeout(timeout, command.output())
    .await
    .map_err(|_| GitError::Timeout {
      url: url.to_string(),
      timeout,
    })?
    .map_err(|source| GitError::Spawn { source })?;

  if !output.status.success() {
    return Err(GitError::Failed {
      url: url.to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }

  Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `<commit>\t<ref>` lines.
pub fn parse_ls_remote(output: &str) -> BTreeMap<String, String> {
  output
    .lines()
    .filter_map(|line| {
      let (commit, name) = line.split_once('\t')?;
      Some((name.trim().to_string(), commit.trim().to_string()))
    })
    .collect()
}
