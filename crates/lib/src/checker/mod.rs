//! Version-discovery strategies.
//!
//! Every strategy implements [`Checker`]. The [`CheckerRegistry`] holds them in
//! priority order and decides which apply to a source:
//! - typed checkers apply when the source's checker data names their type
//! - fallback checkers apply only when no typed checker does

pub mod git;
pub mod rotating_url;
pub mod schema;
pub mod url;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::{WRONG_CONTENT_TYPES_ARCHIVE, WRONG_CONTENT_TYPES_FILE};
use crate::external::{CheckResult, ExternalSource, ExternalState, SourceKind, State};
use crate::http::{HttpClient, HttpError};
use crate::manifest::CheckerOptions;

pub use git::GitChecker;
pub use rotating_url::RotatingUrlChecker;
pub use url::UrlChecker;

/// Errors a checker reports for one source. None of them abort the run.
#[derive(Debug, Error)]
pub enum CheckerError {
  /// The checker data is invalid; nothing was fetched.
  #[error("invalid checker metadata: {message}")]
  Metadata { message: String },

  /// The remote answered but the answer was unusable.
  #[error("error querying for new versions: {message}")]
  Query { message: String },

  /// Downloading or verifying the upstream artifact failed.
  #[error("error downloading upstream source: {message}")]
  Fetch { message: String },

  #[error("timed out: {message}")]
  Timeout { message: String },
}

impl CheckerError {
  pub fn metadata(message: impl Into<String>) -> Self {
    CheckerError::Metadata { message: message.into() }
  }

  pub fn query(message: impl Into<String>) -> Self {
    CheckerError::Query { message: message.into() }
  }

  pub fn fetch(message: impl Into<String>) -> Self {
    CheckerError::Fetch { message: message.into() }
  }

  /// Classify an HTTP failure that happened while querying.
  pub fn from_query(err: HttpError) -> Self {
    match err {
      HttpError::Timeout { .. } => CheckerError::Timeout { message: err.to_string() },
      _ => CheckerError::query(err.to_string()),
    }
  }

  /// Classify an HTTP failure that happened while downloading.
  pub fn from_fetch(err: HttpError) -> Self {
    match err {
      HttpError::Timeout { .. } => CheckerError::Timeout { message: err.to_string() },
      HttpError::ContentType { .. } => CheckerError::query(err.to_string()),
      _ => CheckerError::fetch(err.to_string()),
    }
  }
}

/// Shared, read-only state handed to every check.
pub struct CheckContext<'a> {
  pub http: &'a HttpClient,
  pub options: &'a CheckerOptions,
}

/// A version-discovery strategy.
///
/// `check` writes into `result` rather than the source itself; the caller
/// commits the result once every applicable checker ran, so a failed or
/// cancelled check leaves the source untouched.
#[async_trait]
pub trait Checker: Send + Sync {
  fn name(&self) -> &'static str;

  /// Lower runs first.
  fn priority(&self) -> i32 {
    50
  }

  /// The `x-checker-data.type` this checker handles. `None` means the checker
  /// is never selected by type and only runs as a fallback.
  fn data_type(&self) -> Option<&'static str> {
    None
  }

  fn supported_kinds(&self) -> &'static [SourceKind] {
    &[SourceKind::File, SourceKind::Archive, SourceKind::ExtraData]
  }

  fn should_check(&self, source: &ExternalSource) -> bool {
    self.supported_kinds().contains(&source.kind())
      && self.data_type().is_some_and(|ty| source.checker_type() == Some(ty))
  }

  /// JSON Schema for the checker data this checker reads.
  fn schema(&self, _kind: SourceKind) -> Option<serde_json::Value> {
    None
  }

  /// Validate the source's checker data before any network access.
  fn validate(&self, source: &ExternalSource) -> Result<(), CheckerError> {
    match self.schema(source.kind()) {
      Some(schema) => schema::validate(&schema, source.checker_data())
        .map_err(|e| CheckerError::metadata(format!("{}: {}", source.id(), e))),
      None => Ok(()),
    }
  }

  async fn check(&self, ctx: &CheckContext<'_>, source: &ExternalSource, result: &mut CheckResult) -> Result<(), CheckerError>;
}

/// The ordered set of available checkers.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
  checkers: Vec<Arc<dyn Checker>>,
  fallbacks: Vec<Arc<dyn Checker>>,
}

impl CheckerRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// The checkers shipped with this crate.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(Arc::new(RotatingUrlChecker));
    registry.register(Arc::new(GitChecker));
    registry.register_fallback(Arc::new(UrlChecker));
    registry
  }

  /// Add a typed checker, keeping priority order. Equal priorities keep
  /// registration order.
  pub fn register(&mut self, checker: Arc<dyn Checker>) {
    let pos = self.checkers.partition_point(|c| c.priority() <= checker.priority());
    self.checkers.insert(pos, checker);
  }

  pub fn register_fallback(&mut self, checker: Arc<dyn Checker>) {
    let pos = self.fallbacks.partition_point(|c| c.priority() <= checker.priority());
    self.fallbacks.insert(pos, checker);
  }

  pub fn checkers(&self) -> impl Iterator<Item = &Arc<dyn Checker>> {
    self.checkers.iter().chain(self.fallbacks.iter())
  }

  /// Checkers to run for `source`, in the order they should run.
  pub fn applicable(&self, source: &ExternalSource) -> Vec<Arc<dyn Checker>> {
    let typed: Vec<Arc<dyn Checker>> = self.checkers.iter().filter(|c| c.should_check(source)).cloned().collect();
    if !typed.is_empty() {
      return typed;
    }
    self
      .fallbacks
      .iter()
      .filter(|c| c.supported_kinds().contains(&source.kind()))
      .cloned()
      .collect()
  }
}

impl std::fmt::Debug for CheckerRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CheckerRegistry")
      .field("checkers", &self.checkers.iter().map(|c| c.name()).collect::<Vec<_>>())
      .field("fallbacks", &self.fallbacks.iter().map(|c| c.name()).collect::<Vec<_>>())
      .finish()
  }
}

/// Content types that mean a download of `kind` served an error page.
pub fn wrong_content_types(kind: SourceKind) -> &'static [&'static str] {
  match kind {
    SourceKind::Archive => WRONG_CONTENT_TYPES_ARCHIVE,
    _ => WRONG_CONTENT_TYPES_FILE,
  }
}

/// Attach `new_version` to `result`, or mark the source valid if nothing changed.
///
/// A file candidate sharing no digest algorithm with the pinned source is
/// downloaded once more to compute every digest; the download must match the
/// digests the checker supplied or the check fails.
pub async fn set_new_version(
  ctx: &CheckContext<'_>,
  source: &ExternalSource,
  result: &mut CheckResult,
  new_version: ExternalState,
) -> Result<(), CheckerError> {
  let new_version = match (source.current_version(), new_version) {
    (ExternalState::File(current), ExternalState::File(candidate)) if !current.checksum.shares_kind_with(&candidate.checksum) => {
      warn!(
        source = %source,
        pinned = %current.checksum,
        supplied = %candidate.checksum,
        "candidate lacks a pinned digest type, downloading to complete digests"
      );
      let completed = ctx.http.hash_url(&candidate.url).await.map_err(CheckerError::from_fetch)?;
      if !candidate.checksum.is_empty() && !candidate.checksum.matches(&completed).unwrap_or(false) {
        return Err(CheckerError::fetch(format!(
          "checksum mismatch for {}: expected {}, got {}",
          candidate.url, candidate.checksum, completed
        )));
      }
      ExternalState::File(candidate.with_checksum(completed))
    }
    (_, candidate) => candidate,
  };

  if !source.current_version().differs_from(&new_version) {
    debug!(source = %source, "candidate equals pinned version");
    result.state = State::Valid;
    return Ok(());
  }

  result.new_version = Some(new_version);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manifest::ManifestChecker;
  use serde_json::json;
  use std::fs;
  use tempfile::TempDir;

  struct Named(&'static str, i32, Option<&'static str>);

  #[async_trait]
  impl Checker for Named {
    fn name(&self) -> &'static str {
      self.0
    }

    fn priority(&self) -> i32 {
      self.1
    }

    fn data_type(&self) -> Option<&'static str> {
      self.2
    }

    async fn check(&self, _: &CheckContext<'_>, _: &ExternalSource, _: &mut CheckResult) -> Result<(), CheckerError> {
      Ok(())
    }
  }

  fn load(sources: serde_json::Value) -> (TempDir, ManifestChecker) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("m.json");
    fs::write(&path, json!({"name": "m", "sources": sources}).to_string()).unwrap();
    let checker = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();
    (dir, checker)
  }

  #[test]
  fn registry_orders_by_priority_then_registration() {
    let mut registry = CheckerRegistry::new();
    registry.register(Arc::new(Named("late", 90, Some("x"))));
    registry.register(Arc::new(Named("early", 10, Some("x"))));
    registry.register(Arc::new(Named("early-too", 10, Some("x"))));

    let names: Vec<&str> = registry.checkers().map(|c| c.name()).collect();
    assert_eq!(names, ["early", "early-too", "late"]);
  }

  #[test]
  fn typed_checkers_shadow_fallbacks() {
    let mut registry = CheckerRegistry::new();
    registry.register(Arc::new(Named("typed", 10, Some("x"))));
    registry.register_fallback(Arc::new(Named("fallback", 100, None)));

    let (_dir, manifest) = load(json!([
      {"type": "file", "url": "https://a/1", "sha256": "aa", "x-checker-data": {"type": "x"}},
      {"type": "file", "url": "https://a/2", "sha256": "aa"},
      {"type": "git", "url": "https://a/3.git"}
    ]));
    let sources = manifest.external_data(None);

    let names = |idx: usize| -> Vec<&'static str> { registry.applicable(&sources[idx]).iter().map(|c| c.name()).collect() };
    assert_eq!(names(0), ["typed"]);
    assert_eq!(names(1), ["fallback"]);
    assert!(names(2).is_empty());
  }

  #[test]
  fn untyped_checker_never_matches_by_type() {
    let (_dir, manifest) = load(json!([{"type": "file", "url": "https://a/1", "sha256": "aa"}]));
    let source = &manifest.external_data(None)[0];
    assert!(!Named("untyped", 1, None).should_check(source));
  }

  #[test]
  fn http_errors_are_classified() {
    let timeout = HttpError::Timeout { url: "u".into() };
    assert!(matches!(CheckerError::from_fetch(timeout), CheckerError::Timeout { .. }));
    let page = HttpError::ContentType {
      url: "u".into(),
      content_type: "text/html".into(),
    };
    assert!(matches!(CheckerError::from_fetch(page), CheckerError::Query { .. }));
    let status = HttpError::Status {
      url: "u".into(),
      status: 500,
    };
    assert!(matches!(CheckerError::from_fetch(status), CheckerError::Fetch { .. }));
  }

  mod digest_completion {
    use super::*;
    use crate::checksum::{DigestKind, MultiDigest, hash_bytes};
    use crate::external::ExternalFile;

    fn context_parts() -> (HttpClient, CheckerOptions) {
      let options = CheckerOptions::default();
      (HttpClient::from_options(&options).unwrap(), options)
    }

    #[tokio::test]
    async fn missing_digest_type_is_completed_by_download() {
      let mut server = mockito::Server::new_async().await;
      let _file = server.mock("GET", "/new.tar").with_status(200).with_body("hello world").create_async().await;
      let (_dir, manifest) = load(json!([{"type": "file", "url": "https://a/old.tar", "md5": "00"}]));
      let source = &manifest.external_data(None)[0];

      let (http, options) = context_parts();
      let ctx = CheckContext { http: &http, options: &options };
      let supplied = hash_bytes(b"hello world");
      let candidate = ExternalFile::new(
        format!("{}/new.tar", server.url()),
        MultiDigest::new().with(DigestKind::Sha256, supplied.get(DigestKind::Sha256).unwrap()),
      );

      let mut result = CheckResult::default();
      set_new_version(&ctx, source, &mut result, ExternalState::File(candidate)).await.unwrap();
      let new = result.new_version.unwrap();
      assert_eq!(new.as_file().unwrap().checksum.get(DigestKind::Md5), supplied.get(DigestKind::Md5));
    }

    #[tokio::test]
    async fn mismatch_after_download_is_a_fetch_error() {
      let mut server = mockito::Server::new_async().await;
      let _file = server.mock("GET", "/new.tar").with_status(200).with_body("tampered").create_async().await;
      let (_dir, manifest) = load(json!([{"type": "file", "url": "https://a/old.tar", "md5": "00"}]));
      let source = &manifest.external_data(None)[0];

      let (http, options) = context_parts();
      let ctx = CheckContext { http: &http, options: &options };
      let candidate = ExternalFile::new(
        format!("{}/new.tar", server.url()),
        MultiDigest::new().with(DigestKind::Sha256, hash_bytes(b"hello world").get(DigestKind::Sha256).unwrap()),
      );

      let mut result = CheckResult::default();
      let err = set_new_version(&ctx, source, &mut result, ExternalState::File(candidate)).await.unwrap_err();
      assert!(matches!(err, CheckerError::Fetch { .. }));
      assert!(result.new_version.is_none());
    }

    #[tokio::test]
    async fn unchanged_candidate_marks_valid() {
      let (_dir, manifest) = load(json!([{"type": "file", "url": "https://a/old.tar", "sha256": "aa"}]));
      let source = &manifest.external_data(None)[0];
      let (http, options) = context_parts();
      let ctx = CheckContext { http: &http, options: &options };

      let same = ExternalFile::new("https://a/old.tar", MultiDigest::new().with(DigestKind::Sha256, "aa"));
      let mut result = CheckResult::default();
      set_new_version(&ctx, source, &mut result, ExternalState::File(same)).await.unwrap();
      assert_eq!(result.state, State::Valid);
      assert!(result.new_version.is_none());
    }
  }
}
