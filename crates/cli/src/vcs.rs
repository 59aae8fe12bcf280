//! Committing rewritten manifests with git.
//!
//! The commit lands on a fresh branch named after the current branch and the
//! written tree, so reruns producing the same content reuse the same name.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info};

const MAX_SUBJECT_LEN: usize = 70;

/// Module names in order of first appearance in the change list.
fn changed_modules(changes: &[String]) -> Vec<&str> {
  let mut modules: Vec<&str> = Vec::new();
  for change in changes {
    let module = change.split_once(':').map_or(change.as_str(), |(owner, _)| owner);
    if !modules.contains(&module) {
      modules.push(module);
    }
  }
  modules
}

/// Commit subject summarizing which modules changed.
pub fn commit_subject(changes: &[String]) -> String {
  let modules = changed_modules(changes);
  match modules.as_slice() {
    [] => "Update modules".to_string(),
    [one] => format!("Update {} module", one),
    _ => {
      for shown in (1..modules.len()).rev() {
        let listed = modules[..shown].join(", ");
        let rest = modules.len() - shown;
        let subject = if rest == 1 {
          format!("Update {} and {} modules", listed, modules[shown])
        } else {
          format!("Update {} and {} more modules", listed, rest)
        };
        if subject.len() <= MAX_SUBJECT_LEN {
          return subject;
        }
      }
      format!("Update {} modules", modules.len())
    }
  }
}

pub fn branch_name(base: &str, tree: &str) -> String {
  let short = tree.get(..7).unwrap_or(tree);
  format!("update-{}-{}", base, short)
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
  debug!(?args, dir = %dir.display(), "running git");
  let output = Command::new("git")
    .args(args)
    .current_dir(dir)
    .stdin(Stdio::null())
    .output()
    .await
    .context("Failed to run git")?;

  if !output.status.success() {
    bail!(
      "git {} failed: {}",
      args.join(" "),
      String::from_utf8_lossy(&output.stderr).trim()
    );
  }
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Commit every tracked change under `dir` on a new branch, returning its name.
pub async fn commit_changes(dir: &Path, changes: &[String]) -> Result<String> {
  let base = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
  git(dir, &["add", "--update", "."]).await?;
  let tree = git(dir, &["write-tree"]).await?;
  let branch = branch_name(&base, &tree);

  git(dir, &["checkout", "-b", &branch]).await?;
  let subject = commit_subject(changes);
  let body = changes.join("\n");
  git(dir, &["commit", "-m", &subject, "-m", &body]).await?;

  info!(branch = %branch, subject = %subject, "committed manifest updates");
  Ok(branch)
}
