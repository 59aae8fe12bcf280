//! Build modules: named units owning sources and nested modules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::external::source::ExternalSource;

/// Index of a module in the loaded module list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) usize);

impl ModuleId {
  pub fn index(self) -> usize {
    self.0
  }
}

#[derive(Debug)]
pub struct Module {
  name: String,
  document: PathBuf,
  sources: Vec<Arc<ExternalSource>>,
  children: Vec<ModuleId>,
  parent: Option<ModuleId>,
}

impl Module {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The manifest file the module was declared in.
  pub fn document(&self) -> &Path {
    &self.document
  }

  /// Sources in declaration order, including ones shared with other modules.
  pub fn sources(&self) -> &[Arc<ExternalSource>] {
    &self.sources
  }

  pub fn children(&self) -> &[ModuleId] {
    &self.children
  }

  pub fn parent(&self) -> Option<ModuleId> {
    self.parent
  }
}

/// A module whose sources are still indices into the draft source list.
#[derive(Debug, Clone)]
pub(crate) struct ModuleDraft {
  pub name: String,
  pub document: PathBuf,
  pub sources: Vec<usize>,
  pub children: Vec<ModuleId>,
  pub parent: Option<ModuleId>,
}

impl ModuleDraft {
  pub fn new(name: impl Into<String>, document: &Path, parent: Option<ModuleId>) -> Self {
    Self {
      name: name.into(),
      document: document.to_path_buf(),
      sources: Vec::new(),
      children: Vec::new(),
      parent,
    }
  }

  pub fn into_module(self, sources: &[Arc<ExternalSource>]) -> Module {
    Module {
      name: self.name,
      document: self.document,
      sources: self.sources.iter().filter_map(|idx| sources.get(*idx).cloned()).collect(),
      children: self.children,
      parent: self.parent,
    }
  }
}
