//! Manifest loading and the check/update façade.
//!
//! A `ManifestChecker` owns everything read from a root manifest: the parsed
//! documents, the module forest and the flat source list. It drives a run:
//! load → check → list outdated → update.

pub mod document;
mod loader;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::check::{self, RunError};
use crate::checker::CheckerRegistry;
use crate::consts::{MAX_MANIFEST_SIZE, TIMEOUT_CONNECT, TIMEOUT_TOTAL};
use crate::external::{ExternalSource, Module, ModuleId, SourceKind};
use crate::update;

pub use document::{DocumentFormat, EditorConfig, FragmentKey, Indent, ManifestDocument, TextStyle, lookup_editorconfig};

/// Fatal errors while loading a manifest graph. Nothing is checked after one.
#[derive(Debug, Error)]
pub enum LoadError {
  #[error("manifest file not found: {path}")]
  NotFound { path: PathBuf },

  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("manifest file size {size} bytes exceeds {limit} bytes: {path}")]
  TooLarge { path: PathBuf, size: u64, limit: u64 },

  #[error("failed to parse {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("can't determine manifest kind of {path}")]
  UnknownKind { path: PathBuf },

  #[error("nested external source manifests not allowed: {reference} referenced from {path}")]
  NestedSources { reference: String, path: PathBuf },

  #[error("source {source_id}: parent source with id \"{parent_id}\" not found")]
  UnresolvedParent { source_id: String, parent_id: String },

  #[error("inheritance loop detected: {}", chain.join(" -> "))]
  ParentCycle { chain: Vec<String> },
}

/// What the root manifest describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
  /// An application manifest (has `id` or `app-id`).
  App,
  /// A single module.
  Module,
  /// A bare source object.
  Source,
  /// A bare list of sources.
  Sources,
}

/// Options for a run.
#[derive(Debug, Clone)]
pub struct CheckerOptions {
  /// Largest manifest file read, in bytes.
  pub max_manifest_size: u64,
  /// Only rewrite manifests when an important or main source changed.
  pub require_important_update: bool,
  /// Maximum number of sources checked at once.
  pub parallelism: usize,
  /// Wall-clock cap for the whole check phase.
  pub run_timeout: Option<Duration>,
  pub connect_timeout: Duration,
  pub total_timeout: Duration,
}

impl Default for CheckerOptions {
  fn default() -> Self {
    Self {
      max_manifest_size: MAX_MANIFEST_SIZE,
      require_important_update: false,
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      run_timeout: None,
      connect_timeout: TIMEOUT_CONNECT,
      total_timeout: TIMEOUT_TOTAL,
    }
  }
}

/// A loaded manifest graph and the results of checking it.
#[derive(Debug)]
pub struct ManifestChecker {
  root: PathBuf,
  kind: ManifestKind,
  app_id: Option<String>,
  options: CheckerOptions,
  pub(crate) documents: Vec<ManifestDocument>,
  modules: Vec<Module>,
  sources: Vec<Arc<ExternalSource>>,
  errors: Vec<RunError>,
  /// Ids of sources whose candidate has been written back.
  pub(crate) applied: HashSet<String>,
}

impl ManifestChecker {
  /// Load `path` and every manifest it references.
  pub fn new(path: impl AsRef<Path>, options: CheckerOptions) -> Result<Self, LoadError> {
    let root = path.as_ref().to_path_buf();
    info!(path = %root.display(), "loading manifest");

    let graph = loader::load(&root, &options)?;
    info!(
      kind = ?graph.kind,
      modules = graph.modules.len(),
      sources = graph.sources.len(),
      errors = graph.errors.len(),
      "manifest loaded"
    );

    Ok(Self {
      root,
      kind: graph.kind,
      app_id: graph.app_id,
      options,
      documents: graph.documents,
      modules: graph.modules,
      sources: graph.sources,
      errors: graph.errors.into_iter().map(RunError::from).collect(),
      applied: HashSet::new(),
    })
  }

  pub fn root_path(&self) -> &Path {
    &self.root
  }

  pub fn kind(&self) -> ManifestKind {
    self.kind
  }

  pub fn app_id(&self) -> Option<&str> {
    self.app_id.as_deref()
  }

  pub fn options(&self) -> &CheckerOptions {
    &self.options
  }

  /// Modules in pre-order.
  pub fn modules(&self) -> &[Module] {
    &self.modules
  }

  pub fn module(&self, id: ModuleId) -> Option<&Module> {
    self.modules.get(id.index())
  }

  pub fn documents(&self) -> &[ManifestDocument] {
    &self.documents
  }

  /// Every source, optionally only those of one kind.
  pub fn external_data(&self, only_type: Option<SourceKind>) -> Vec<Arc<ExternalSource>> {
    self
      .sources
      .iter()
      .filter(|s| only_type.is_none_or(|kind| s.kind() == kind))
      .cloned()
      .collect()
  }

  pub fn source(&self, id: &str) -> Option<&Arc<ExternalSource>> {
    self.sources.iter().find(|s| s.id() == id)
  }

  /// Sources that are broken or have a candidate version.
  pub fn outdated_external_data(&self) -> Vec<Arc<ExternalSource>> {
    self.sources.iter().filter(|s| s.is_outdated()).cloned().collect()
  }

  /// Errors accumulated while loading, checking and updating.
  pub fn errors(&self) -> &[RunError] {
    &self.errors
  }

  pub(crate) fn push_error(&mut self, error: RunError) {
    self.errors.push(error);
  }

  /// Run every applicable checker and return the sources that were processed.
  pub async fn check(&mut self, registry: &CheckerRegistry, filter_type: Option<SourceKind>) -> Vec<Arc<ExternalSource>> {
    let sources = self.external_data(filter_type);
    let outcome = check::run(sources, registry, &self.options).await;
    self.errors.extend(outcome.errors);
    outcome.checked
  }

  /// Write candidate versions back into the manifests.
  ///
  /// Returns the change messages, deduplicated and in order.
  pub fn update_manifests(&mut self) -> Vec<String> {
    update::update_manifests(self)
  }
}
