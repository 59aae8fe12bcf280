//! External sources: one pinned artifact declared in a manifest.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::checksum::MultiDigest;
use crate::consts::{CHECKER_DATA_KEY, CHECKER_TYPE_PROP, IMPORTANT_SRC_PROP, MAIN_SRC_PROP, PARENT_ID_PROP};
use crate::external::types::{ExternalFile, ExternalGitRef, ExternalState};
use crate::manifest::document::FragmentKey;

/// Errors for a single malformed source entry. Never fatal to a load.
#[derive(Debug, Clone, Error)]
pub enum SourceLoadError {
  #[error("invalid source in {path}: {message}")]
  Invalid { path: PathBuf, message: String },
}

/// The manifest `type` of a source we know how to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
  File,
  Archive,
  ExtraData,
  Git,
}

impl SourceKind {
  pub fn as_str(self) -> &'static str {
    match self {
      SourceKind::File => "file",
      SourceKind::Archive => "archive",
      SourceKind::ExtraData => "extra-data",
      SourceKind::Git => "git",
    }
  }

  /// File, archive and extra-data sources are all plain downloads.
  pub fn is_file_like(self) -> bool {
    !matches!(self, SourceKind::Git)
  }
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SourceKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "file" => Ok(SourceKind::File),
      "archive" => Ok(SourceKind::Archive),
      "extra-data" => Ok(SourceKind::ExtraData),
      "git" => Ok(SourceKind::Git),
      other => Err(format!("unsupported source type: {}", other)),
    }
  }
}

/// Outcome of checking a source.
///
/// `Unknown` is initial. `Valid` and `Broken` are terminal for a run and never
/// revert to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
  #[default]
  Unknown,
  Valid,
  Broken,
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      State::Unknown => "UNKNOWN",
      State::Valid => "VALID",
      State::Broken => "BROKEN",
    };
    f.write_str(s)
  }
}

/// The mutable part of a source: what checkers found out about it.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
  pub state: State,
  pub new_version: Option<ExternalState>,
}

impl CheckResult {
  /// A checker produced a meaningful answer; later checkers are skipped.
  pub fn is_settled(&self) -> bool {
    self.state != State::Unknown || self.new_version.is_some()
  }
}

/// One external source, shared between every module that references it.
pub struct ExternalSource {
  id: String,
  kind: SourceKind,
  filename: String,
  arches: Vec<String>,
  checker_data: Map<String, Value>,
  current: ExternalState,
  module: Option<String>,
  document: PathBuf,
  fragment: FragmentKey,
  parent: Option<Arc<ExternalSource>>,
  result: Mutex<CheckResult>,
}

impl ExternalSource {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn kind(&self) -> SourceKind {
    self.kind
  }

  pub fn filename(&self) -> &str {
    &self.filename
  }

  pub fn arches(&self) -> &[String] {
    &self.arches
  }

  pub fn checker_data(&self) -> &Map<String, Value> {
    &self.checker_data
  }

  /// The version currently pinned in the manifest.
  pub fn current_version(&self) -> &ExternalState {
    &self.current
  }

  /// Name of the first module this source was loaded from.
  pub fn module(&self) -> Option<&str> {
    self.module.as_deref()
  }

  /// The manifest file the source fragment lives in.
  pub fn document(&self) -> &Path {
    &self.document
  }

  pub(crate) fn fragment(&self) -> &FragmentKey {
    &self.fragment
  }

  /// The source that must be checked before this one.
  pub fn parent(&self) -> Option<&Arc<ExternalSource>> {
    self.parent.as_ref()
  }

  pub fn checker_type(&self) -> Option<&str> {
    self.checker_data.get(CHECKER_TYPE_PROP).and_then(Value::as_str)
  }

  pub fn parent_id(&self) -> Option<&str> {
    self.checker_data.get(PARENT_ID_PROP).and_then(Value::as_str)
  }

  pub fn is_main_source(&self) -> bool {
    self.checker_data.get(MAIN_SRC_PROP).and_then(Value::as_bool).unwrap_or(false)
  }

  /// The explicit `is-important` flag, if any.
  pub fn important_flag(&self) -> Option<bool> {
    self.checker_data.get(IMPORTANT_SRC_PROP).and_then(Value::as_bool)
  }

  /// Flagged important, or main and not explicitly unimportant.
  pub fn is_important(&self) -> bool {
    match self.important_flag() {
      Some(flag) => flag,
      None => self.is_main_source(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, CheckResult> {
    self.result.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn state(&self) -> State {
    self.lock().state
  }

  pub fn new_version(&self) -> Option<ExternalState> {
    self.lock().new_version.clone()
  }

  /// Snapshot of everything checkers recorded so far.
  pub fn result(&self) -> CheckResult {
    self.lock().clone()
  }

  /// Merge a checker result into the source.
  ///
  /// An `Unknown` state never overwrites a settled one and a missing candidate
  /// never clears an existing one.
  pub fn commit(&self, result: CheckResult) {
    let mut guard = self.lock();
    if result.state != State::Unknown {
      guard.state = result.state;
    }
    if result.new_version.is_some() {
      guard.new_version = result.new_version;
    }
  }

  /// Broken, or a candidate version is attached.
  pub fn is_outdated(&self) -> bool {
    let guard = self.lock();
    guard.state == State::Broken || guard.new_version.is_some()
  }

  /// A candidate exists and it differs from the pinned version.
  pub fn has_version_changed(&self) -> bool {
    match self.lock().new_version.as_ref() {
      Some(new) => self.current.differs_from(new),
      None => false,
    }
  }
}

impl fmt::Display for ExternalSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.id, self.filename)
  }
}

impl fmt::Debug for ExternalSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExternalSource")
      .field("id", &self.id)
      .field("kind", &self.kind)
      .field("filename", &self.filename)
      .field("document", &self.document)
      .field("parent", &self.parent.as_ref().map(|p| p.id()))
      .field("result", &*self.lock())
      .finish()
  }
}

/// A parsed source that has not been linked to its parent yet.
#[derive(Debug, Clone)]
pub(crate) struct SourceDraft {
  pub id: String,
  pub kind: SourceKind,
  pub filename: String,
  pub arches: Vec<String>,
  pub checker_data: Map<String, Value>,
  pub current: ExternalState,
  pub module: Option<String>,
  pub document: PathBuf,
  pub fragment: FragmentKey,
}

impl SourceDraft {
  pub fn parent_id(&self) -> Option<&str> {
    self.checker_data.get(PARENT_ID_PROP).and_then(Value::as_str)
  }

  pub fn into_source(self, parent: Option<Arc<ExternalSource>>) -> ExternalSource {
    ExternalSource {
      id: self.id,
      kind: self.kind,
      filename: self.filename,
      arches: self.arches,
      checker_data: self.checker_data,
      current: self.current,
      module: self.module,
      document: self.document,
      fragment: self.fragment,
      parent,
      result: Mutex::new(CheckResult::default()),
    }
  }
}

/// What parsing one source fragment produced.
#[derive(Debug)]
pub(crate) enum FragmentOutcome {
  Loaded(Box<SourceDraft>),
  /// Not something we check (no URL, local path, patch, ...).
  Unsupported(String),
  Invalid(SourceLoadError),
}

/// Where a fragment was found, used to build its id.
pub(crate) struct FragmentOrigin<'a> {
  pub document: &'a Path,
  /// Owning module name, or the document stem for module-less manifests.
  pub owner: &'a str,
  pub module: Option<&'a str>,
  pub index: usize,
  pub fragment: FragmentKey,
}

fn invalid(path: &Path, message: impl Into<String>) -> FragmentOutcome {
  FragmentOutcome::Invalid(SourceLoadError::Invalid {
    path: path.to_path_buf(),
    message: message.into(),
  })
}

fn optional_string(source: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
  match source.get(key) {
    None | Some(Value::Null) => Ok(None),
    Some(Value::String(s)) => Ok(Some(s.clone())),
    Some(other) => Err(format!("\"{}\" must be a string, got {}", key, other)),
  }
}

/// Last path segment of a URL, without query or fragment.
pub(crate) fn url_basename(url: &str) -> String {
  let path = url.split(['?', '#']).next().unwrap_or(url);
  let trimmed = path.trim_end_matches('/');
  trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Parse one source fragment into a draft.
pub(crate) fn parse_fragment(source: &Map<String, Value>, origin: FragmentOrigin<'_>) -> FragmentOutcome {
  let path = origin.document;

  let Some(type_value) = source.get("type") else {
    return FragmentOutcome::Unsupported("source has no type".to_string());
  };
  let Some(type_name) = type_value.as_str() else {
    return invalid(path, format!("\"type\" must be a string, got {}", type_value));
  };
  let kind = match type_name.parse::<SourceKind>() {
    Ok(kind) => kind,
    Err(message) => return FragmentOutcome::Unsupported(message),
  };

  let url = match source.get("url") {
    None => return FragmentOutcome::Unsupported(format!("{} source has no url", type_name)),
    Some(Value::String(url)) => url.clone(),
    Some(other) => return invalid(path, format!("\"url\" must be a string, got {}", other)),
  };

  let checker_data = match source.get(CHECKER_DATA_KEY) {
    None => Map::new(),
    Some(Value::Object(map)) => map.clone(),
    Some(other) => return invalid(path, format!("\"{}\" must be an object, got {}", CHECKER_DATA_KEY, other)),
  };

  let arches = match source.get("only-arches") {
    None => Vec::new(),
    Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(String::from).collect(),
    Some(other) => return invalid(path, format!("\"only-arches\" must be a list, got {}", other)),
  };

  let (filename, current) = if kind.is_file_like() {
    let Some(checksum) = MultiDigest::from_source(source) else {
      return invalid(path, format!("{} source {} has no checksum", type_name, url));
    };
    let size = match source.get("size") {
      None => None,
      Some(value) => match value.as_u64() {
        Some(size) => Some(size),
        None => return invalid(path, format!("\"size\" must be a non-negative integer, got {}", value)),
      },
    };
    let name_keys: &[&str] = if kind == SourceKind::ExtraData {
      &["filename", "dest-filename"]
    } else {
      &["dest-filename"]
    };
    let filename = name_keys
      .iter()
      .find_map(|key| source.get(*key).and_then(Value::as_str))
      .map(String::from)
      .unwrap_or_else(|| url_basename(&url));
    (filename, ExternalState::File(ExternalFile::new(url.clone(), checksum).with_size(size)))
  } else {
    let fields = (|| -> Result<_, String> {
      Ok((
        optional_string(source, "commit")?,
        optional_string(source, "tag")?,
        optional_string(source, "branch")?,
      ))
    })();
    let (commit, tag, branch) = match fields {
      Ok(fields) => fields,
      Err(message) => return invalid(path, message),
    };
    let git_ref = ExternalGitRef::new(url.clone()).with_commit(commit).with_tag(tag).with_branch(branch);
    let name = url_basename(&url);
    let name = name.strip_suffix(".git").map(String::from).unwrap_or(name);
    (name, ExternalState::Git(git_ref))
  };

  FragmentOutcome::Loaded(Box::new(SourceDraft {
    id: format!("{}-{}-{}", origin.owner, kind, origin.index),
    kind,
    filename,
    arches,
    checker_data,
    current,
    module: origin.module.map(String::from),
    document: origin.document.to_path_buf(),
    fragment: origin.fragment,
  }))
}
