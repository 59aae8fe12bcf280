//! Writing candidate versions back into manifests.
//!
//! The updater:
//! - selects the sources whose candidate differs from what is pinned
//! - honours the important-update policy
//! - edits every location of each source's fragment, then rewrites only the
//!   documents that changed
//! - records a release in the application's metadata file

pub mod appdata;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::check::RunError;
use crate::checksum::DigestError;
use crate::external::{ExternalFile, ExternalGitRef, ExternalSource, ExternalState, SourceKind};
use crate::manifest::{ManifestChecker, ManifestKind};

#[derive(Debug, Error)]
pub enum UpdateError {
  /// The candidate carries none of the digest types the manifest declares.
  #[error("cannot update {source_id}: {error}")]
  NoCommonDigest {
    source_id: String,
    #[source]
    error: DigestError,
  },

  #[error("failed to write {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize {path}: {message}")]
  Serialize { path: PathBuf, message: String },
}

/// Apply every changed candidate of `checker` to its manifests.
///
/// Returns the change messages, deduplicated and in source order. Errors are
/// recorded on `checker` and never stop the remaining updates.
pub(crate) fn update_manifests(checker: &mut ManifestChecker) -> Vec<String> {
  let changed: Vec<Arc<ExternalSource>> = checker
    .external_data(None)
    .into_iter()
    .filter(|s| s.has_version_changed() && !checker.applied.contains(s.id()))
    .collect();

  if changed.is_empty() {
    debug!("no changed sources to write back");
    return Vec::new();
  }

  if checker.options().require_important_update && !changed.iter().any(|s| s.is_important()) {
    info!(
      changed = changed.len(),
      "no important source was updated, leaving manifests untouched"
    );
    return Vec::new();
  }

  let mut messages: Vec<String> = Vec::new();
  for source in &changed {
    let Some(new_version) = source.new_version() else {
      continue;
    };
    match apply(checker, source, &new_version) {
      Ok(()) => {
        checker.applied.insert(source.id().to_string());
        let message = change_message(source, &new_version);
        info!(source = %source, "{}", message);
        if !messages.contains(&message) {
          messages.push(message);
        }
      }
      Err(e) => {
        error!(source = %source, error = %e, "failed to update source");
        checker.push_error(e.into());
      }
    }
  }

  let mut write_errors = Vec::new();
  for document in checker.documents.iter_mut().filter(|d| d.is_dirty()) {
    info!(path = %document.path().display(), "updating manifest");
    if let Err(e) = document.write() {
      error!(path = %document.path().display(), error = %e, "failed to write manifest");
      write_errors.push(RunError::from(e));
    }
  }
  for e in write_errors {
    checker.push_error(e);
  }

  if !messages.is_empty() && checker.kind() == ManifestKind::App {
    update_appdata(checker);
  }

  messages
}

fn apply(checker: &mut ManifestChecker, source: &ExternalSource, new_version: &ExternalState) -> Result<(), UpdateError> {
  let key = source.fragment().clone();
  let Some(document) = checker.documents.iter_mut().find(|d| d.path() == key.document()) else {
    warn!(source = %source, path = %key.document().display(), "source document is not loaded");
    return Ok(());
  };

  match new_version {
    ExternalState::File(file) => document.edit_fragment(&key, |fragment| apply_file(source, file, fragment)),
    ExternalState::Git(git) => document.edit_fragment(&key, |fragment| {
      apply_git(git, fragment);
      Ok(())
    }),
  }
}

fn apply_file(source: &ExternalSource, file: &ExternalFile, fragment: &mut Map<String, Value>) -> Result<(), UpdateError> {
  file
    .checksum
    .update_source(fragment)
    .map_err(|error| UpdateError::NoCommonDigest {
      source_id: source.id().to_string(),
      error,
    })?;
  fragment.insert("url".to_string(), Value::String(file.url.clone()));
  if let Some(size) = file.size
    && (fragment.contains_key("size") || source.kind() == SourceKind::ExtraData)
  {
    fragment.insert("size".to_string(), Value::from(size));
  }
  Ok(())
}

fn apply_git(git: &ExternalGitRef, fragment: &mut Map<String, Value>) {
  fragment.insert("url".to_string(), Value::String(git.url.clone()));
  if let Some(tag) = &git.tag {
    fragment.insert("tag".to_string(), Value::String(tag.clone()));
    fragment.remove("branch");
  } else if let Some(branch) = &git.branch {
    fragment.insert("branch".to_string(), Value::String(branch.clone()));
  }
  if let Some(commit) = &git.commit {
    fragment.insert("commit".to_string(), Value::String(commit.clone()));
  }
}

fn change_message(source: &ExternalSource, new_version: &ExternalState) -> String {
  let owner = match source.module() {
    Some(module) => module.to_string(),
    None => file_stem(source.document()),
  };
  match new_version.version() {
    Some(version) => format!("{}: Update {} to {}", owner, source.filename(), version),
    None => format!("{}: Update {}", owner, source.filename()),
  }
}

fn file_stem(path: &Path) -> String {
  path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default()
}

/// The source whose version names the application release.
///
/// An explicitly flagged main source wins; otherwise the last source declared
/// in the root manifest is taken as a guess.
pub fn main_source(checker: &ManifestChecker) -> Option<Arc<ExternalSource>> {
  let sources = checker.external_data(None);
  if let Some(main) = sources.iter().find(|s| s.is_main_source()) {
    return Some(main.clone());
  }
  let guess = sources.iter().rev().find(|s| s.document() == checker.root_path())?;
  warn!(source = %guess, "Guessed last source as main source");
  Some(guess.clone())
}

fn update_appdata(checker: &mut ManifestChecker) {
  let Some(app_id) = checker.app_id().map(String::from) else {
    return;
  };
  let Some(main) = main_source(checker) else {
    error!(app_id = %app_id, "can't determine main source, not updating appdata");
    return;
  };
  if !main.has_version_changed() {
    debug!(source = %main, "main source unchanged, no release to add");
    return;
  }
  let Some(new_version) = main.new_version() else {
    return;
  };
  let Some(version) = new_version.version().map(String::from) else {
    warn!(source = %main, "main source has no version, not adding a release");
    return;
  };
  let date = new_version.timestamp().unwrap_or_else(Utc::now).format("%F").to_string();

  let dir = checker.root_path().parent().map(Path::to_path_buf).unwrap_or_default();
  let result = appdata::find_appdata_file(&dir, &app_id).and_then(|path| appdata::add_release(&path, &version, &date));
  match result {
    Ok(()) => info!(app_id = %app_id, version = %version, date = %date, "added release to appdata"),
    Err(appdata::AppdataError::NotFound { .. }) => info!(app_id = %app_id, "no appdata file, skipping release"),
    Err(e) => {
      error!(app_id = %app_id, error = %e, "failed to update appdata");
      checker.push_error(e.into());
    }
  }
}
