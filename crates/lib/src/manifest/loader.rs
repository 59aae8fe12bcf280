//! Manifest graph loading.
//!
//! Walks the root manifest and every module or source file it references,
//! producing the module forest and the flat source list:
//! - YAML-aliased source fragments become one shared source; equal fragments
//!   written out separately stay separate sources
//! - malformed sources are recorded and skipped
//! - `parent-id` links are resolved and checked for cycles after the walk

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::external::module::{Module, ModuleDraft, ModuleId};
use crate::external::source::{FragmentOrigin, FragmentOutcome, SourceDraft, parse_fragment};
use crate::external::{ExternalSource, SourceLoadError};
use crate::manifest::document::{FragmentKey, ManifestDocument};
use crate::manifest::{CheckerOptions, LoadError, ManifestKind};

/// Everything produced by a successful load.
#[derive(Debug)]
pub(crate) struct LoadedGraph {
  pub kind: ManifestKind,
  pub app_id: Option<String>,
  pub documents: Vec<ManifestDocument>,
  pub modules: Vec<Module>,
  pub sources: Vec<Arc<ExternalSource>>,
  pub errors: Vec<SourceLoadError>,
}

/// Load the manifest graph rooted at `root`.
pub(crate) fn load(root: &Path, options: &CheckerOptions) -> Result<LoadedGraph, LoadError> {
  let mut loader = Loader::new(root, options);
  let root_idx = loader.read_document(root)?;
  let contents = loader.documents[root_idx].contents().clone();
  let (kind, app_id) = classify(root, &contents)?;
  debug!(path = %root.display(), ?kind, "classified root manifest");

  match kind {
    ManifestKind::App => match contents.get("modules") {
      Some(Value::Array(modules)) => {
        for (i, module) in modules.iter().enumerate() {
          loader.collect_module(root, module, format!("/modules/{}", i), None)?;
        }
      }
      Some(_) => error!(path = %root.display(), "\"modules\" is not a list"),
      None => {}
    },
    ManifestKind::Module => loader.collect_module(root, &contents, String::new(), None)?,
    ManifestKind::Source | ManifestKind::Sources => loader.collect_sources(root, &contents, String::new(), None, false)?,
  }

  loader.finish(kind, app_id)
}

/// Work out what the root document describes.
fn classify(path: &Path, contents: &Value) -> Result<(ManifestKind, Option<String>), LoadError> {
  let object = match contents {
    Value::Array(_) => return Ok((ManifestKind::Sources, None)),
    Value::Object(object) => object,
    _ => return Err(LoadError::UnknownKind { path: path.to_path_buf() }),
  };

  if let Some(id) = object.get("id").or_else(|| object.get("app-id")) {
    return Ok((ManifestKind::App, id.as_str().map(String::from)));
  }
  if object.contains_key("name") && (object.contains_key("sources") || object.contains_key("modules")) {
    return Ok((ManifestKind::Module, None));
  }
  if object.contains_key("type") {
    return Ok((ManifestKind::Source, None));
  }
  Err(LoadError::UnknownKind { path: path.to_path_buf() })
}

struct Loader<'a> {
  options: &'a CheckerOptions,
  root_dir: PathBuf,
  documents: Vec<ManifestDocument>,
  by_path: HashMap<PathBuf, usize>,
  modules: Vec<ModuleDraft>,
  drafts: Vec<SourceDraft>,
  seen: HashMap<FragmentKey, usize>,
  module_less: HashMap<PathBuf, usize>,
  errors: Vec<SourceLoadError>,
}

impl<'a> Loader<'a> {
  fn new(root: &Path, options: &'a CheckerOptions) -> Self {
    Self {
      options,
      root_dir: root.parent().map(Path::to_path_buf).unwrap_or_default(),
      documents: Vec::new(),
      by_path: HashMap::new(),
      modules: Vec::new(),
      drafts: Vec::new(),
      seen: HashMap::new(),
      module_less: HashMap::new(),
      errors: Vec::new(),
    }
  }

  /// Read a document once; later reads hit the cache.
  fn read_document(&mut self, path: &Path) -> Result<usize, LoadError> {
    if let Some(idx) = self.by_path.get(path) {
      return Ok(*idx);
    }
    let document = ManifestDocument::read(path, self.options.max_manifest_size)?;
    let idx = self.documents.len();
    self.documents.push(document);
    self.by_path.insert(path.to_path_buf(), idx);
    Ok(idx)
  }

  fn relative<'p>(&self, path: &'p Path) -> &'p Path {
    path.strip_prefix(&self.root_dir).unwrap_or(path)
  }

  fn document_mut(&mut self, path: &Path) -> Option<&mut ManifestDocument> {
    let idx = *self.by_path.get(path)?;
    self.documents.get_mut(idx)
  }

  fn collect_module(
    &mut self,
    path: &Path,
    module: &Value,
    pointer: String,
    parent: Option<ModuleId>,
  ) -> Result<(), LoadError> {
    let object = match module {
      Value::String(reference) => {
        let module_path = path.parent().unwrap_or(Path::new("")).join(reference);
        info!(path = %self.relative(&module_path).display(), "loading module");
        let idx = match self.read_document(&module_path) {
          Ok(idx) => idx,
          Err(err @ LoadError::NotFound { .. }) => {
            warn!(error = %err, "skipping module");
            return Ok(());
          }
          Err(err) => return Err(err),
        };
        let contents = self.documents[idx].contents().clone();
        if !contents.is_object() {
          return Err(LoadError::Parse {
            path: module_path,
            message: "module manifest is not an object".to_string(),
          });
        }
        return self.collect_module(&module_path, &contents, String::new(), parent);
      }
      Value::Object(object) => object,
      other => {
        warn!(path = %path.display(), value = %other, "ignoring malformed module entry");
        return Ok(());
      }
    };

    let name = object.get("name").and_then(Value::as_str).map(String::from).unwrap_or_else(|| {
      path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
    });
    let id = ModuleId(self.modules.len());
    self.modules.push(ModuleDraft::new(name, path, parent));
    if let Some(parent) = parent {
      self.modules[parent.0].children.push(id);
    }

    match object.get("modules") {
      Some(Value::Array(children)) => {
        for (i, child) in children.iter().enumerate() {
          self.collect_module(path, child, format!("{}/modules/{}", pointer, i), Some(id))?;
        }
      }
      Some(_) => error!(path = %path.display(), module = %self.modules[id.0].name, "\"modules\" is not a list"),
      None => {}
    }

    if let Some(sources) = object.get("sources") {
      self.collect_sources(path, sources, format!("{}/sources", pointer), Some(id), false)?;
    }
    Ok(())
  }

  fn collect_sources(
    &mut self,
    path: &Path,
    source: &Value,
    pointer: String,
    module: Option<ModuleId>,
    is_external: bool,
  ) -> Result<(), LoadError> {
    match source {
      Value::Array(items) => {
        for (i, item) in items.iter().enumerate() {
          self.collect_sources(path, item, format!("{}/{}", pointer, i), module, is_external)?;
        }
        Ok(())
      }
      Value::String(reference) => {
        if is_external {
          return Err(LoadError::NestedSources {
            reference: reference.clone(),
            path: path.to_path_buf(),
          });
        }
        let sources_path = path.parent().unwrap_or(Path::new("")).join(reference);
        info!(path = %self.relative(&sources_path).display(), "loading sources");
        let idx = match self.read_document(&sources_path) {
          Ok(idx) => idx,
          Err(err @ LoadError::TooLarge { .. }) => {
            warn!(error = %err, "skipping sources file");
            return Ok(());
          }
          Err(err) => return Err(err),
        };
        let contents = self.documents[idx].contents().clone();
        self.collect_sources(&sources_path, &contents, String::new(), module, true)
      }
      Value::Object(object) => {
        let canonical = match self.by_path.get(path) {
          Some(&idx) => self.documents[idx].canonical_pointer(&pointer),
          None => pointer.clone(),
        };
        let key = FragmentKey::new(path, canonical);

        if let Some(&existing) = self.seen.get(&key) {
          debug!(
            source = %self.drafts[existing].id,
            first_module = ?self.drafts[existing].module,
            "source already loaded"
          );
          if let Some(doc) = self.document_mut(path) {
            doc.record_fragment(key, pointer);
          }
          if let Some(module) = module {
            self.modules[module.0].sources.push(existing);
          }
          return Ok(());
        }

        let (owner, module_name, index) = match module {
          Some(module) => {
            let draft = &self.modules[module.0];
            (draft.name.clone(), Some(draft.name.clone()), draft.sources.len())
          }
          None => {
            let stem = path
              .file_stem()
              .map(|s| s.to_string_lossy().into_owned())
              .unwrap_or_default();
            let count = self.module_less.entry(path.to_path_buf()).or_default();
            let index = *count;
            *count += 1;
            (stem, None, index)
          }
        };

        let origin = FragmentOrigin {
          document: path,
          owner: &owner,
          module: module_name.as_deref(),
          index,
          fragment: key.clone(),
        };

        match parse_fragment(object, origin) {
          FragmentOutcome::Loaded(draft) => {
            let idx = self.drafts.len();
            debug!(source = %draft.id, path = %self.relative(path).display(), "loaded source");
            self.drafts.push(*draft);
            self.seen.insert(key.clone(), idx);
            if let Some(doc) = self.document_mut(path) {
              doc.record_fragment(key, pointer);
            }
            if let Some(module) = module {
              self.modules[module.0].sources.push(idx);
            }
          }
          FragmentOutcome::Unsupported(reason) => {
            debug!(path = %self.relative(path).display(), pointer = %pointer, reason = %reason, "skipping source");
          }
          FragmentOutcome::Invalid(err) => {
            error!(error = %err, "failed to load source");
            self.errors.push(err);
          }
        }
        Ok(())
      }
      other => {
        warn!(path = %path.display(), value = %other, "ignoring malformed source entry");
        Ok(())
      }
    }
  }

  /// Resolve parent links and build the final sources and modules.
  fn finish(self, kind: ManifestKind, app_id: Option<String>) -> Result<LoadedGraph, LoadError> {
    let sources = link_parents(self.drafts)?;
    let modules = self.modules.into_iter().map(|m| m.into_module(&sources)).collect();

    Ok(LoadedGraph {
      kind,
      app_id,
      documents: self.documents,
      modules,
      sources,
      errors: self.errors,
    })
  }
}

/// Turn drafts into sources, parents first, rejecting unknown ids and cycles.
///
/// The returned list keeps declaration order.
fn link_parents(drafts: Vec<SourceDraft>) -> Result<Vec<Arc<ExternalSource>>, LoadError> {
  let mut by_id: HashMap<&str, usize> = HashMap::new();
  for (idx, draft) in drafts.iter().enumerate() {
    by_id.entry(draft.id.as_str()).or_insert(idx);
  }

  let mut graph: DiGraph<usize, ()> = DiGraph::new();
  let nodes: Vec<NodeIndex> = (0..drafts.len()).map(|idx| graph.add_node(idx)).collect();
  let mut parents: Vec<Option<usize>> = vec![None; drafts.len()];

  for (idx, draft) in drafts.iter().enumerate() {
    let Some(parent_id) = draft.parent_id() else {
      continue;
    };
    let Some(&parent_idx) = by_id.get(parent_id) else {
      return Err(LoadError::UnresolvedParent {
        source_id: draft.id.clone(),
        parent_id: parent_id.to_string(),
      });
    };
    parents[idx] = Some(parent_idx);
    graph.add_edge(nodes[parent_idx], nodes[idx], ());
  }

  for component in tarjan_scc(&graph) {
    let is_cycle = component.len() > 1 || graph.contains_edge(component[0], component[0]);
    if is_cycle {
      let mut members: Vec<usize> = component.iter().map(|n| graph[*n]).collect();
      members.sort_unstable();
      let chain = members.iter().map(|idx| drafts[*idx].id.clone()).collect();
      return Err(LoadError::ParentCycle { chain });
    }
  }

  let order = toposort(&graph, None).map_err(|cycle| LoadError::ParentCycle {
    chain: vec![drafts[graph[cycle.node_id()]].id.clone()],
  })?;

  let mut slots: Vec<Option<Arc<ExternalSource>>> = vec![None; drafts.len()];
  let mut drafts: Vec<Option<SourceDraft>> = drafts.into_iter().map(Some).collect();
  for node in order {
    let idx = graph[node];
    let parent = parents[idx].and_then(|p| slots[p].clone());
    if let Some(draft) = drafts[idx].take() {
      slots[idx] = Some(Arc::new(draft.into_source(parent)));
    }
  }

  Ok(slots.into_iter().flatten().collect())
}
