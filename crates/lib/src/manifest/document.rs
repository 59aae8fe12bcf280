//! Manifest documents on disk.
//!
//! This module provides:
//! - `ManifestDocument`: one parsed JSON or YAML manifest file and its text style
//! - `FragmentKey`: a stable identity for a source fragment inside a document
//! - YAML alias tracking, so aliased fragments resolve to their anchor
//! - `normalize_json()`: strips comments and raw newlines the JSON parser rejects
//! - `lookup_editorconfig()`: indentation and final-newline settings for a file

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use globset::Glob;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use tracing::debug;

use crate::manifest::LoadError;
use crate::update::UpdateError;

const ANCHOR_TAG: &str = "extcheck-anchor-";
const ALIAS_TAG: &str = "extcheck-alias-";

/// Identity of a parsed source fragment: the document it lives in plus the
/// JSON pointer of the node it was parsed from.
///
/// Fragments reached through a YAML alias use the pointer of the anchored
/// node, so they share a key. Equal but separately written fragments do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
  document: PathBuf,
  pointer: String,
}

impl FragmentKey {
  pub fn new(document: &Path, pointer: impl Into<String>) -> Self {
    Self {
      document: document.to_path_buf(),
      pointer: pointer.into(),
    }
  }

  pub fn document(&self) -> &Path {
    &self.document
  }

  pub fn pointer(&self) -> &str {
    &self.pointer
  }
}

impl fmt::Display for FragmentKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.document.display(), self.pointer)
  }
}

/// Escape one JSON pointer reference token.
pub(crate) fn escape_pointer(token: &str) -> String {
  token.replace('~', "~0").replace('/', "~1")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
  Json,
  Yaml,
}

impl DocumentFormat {
  /// `.yaml`/`.yml` are YAML, everything else is JSON.
  pub fn from_path(path: &Path) -> Self {
    match path.extension().and_then(|e| e.to_str()) {
      Some("yaml") | Some("yml") => DocumentFormat::Yaml,
      _ => DocumentFormat::Json,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indent {
  Spaces(usize),
  Tabs,
}

/// Textual style a document is written back with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextStyle {
  pub indent: Indent,
  pub final_newline: bool,
}

/// Settings read from `.editorconfig` files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorConfig {
  pub indent: Option<Indent>,
  pub indent_size: Option<usize>,
  pub insert_final_newline: Option<bool>,
}

impl EditorConfig {
  /// Fill unset fields from a less specific config.
  fn fill_from(&mut self, other: EditorConfig) {
    self.indent = self.indent.or(other.indent);
    self.indent_size = self.indent_size.or(other.indent_size);
    self.insert_final_newline = self.insert_final_newline.or(other.insert_final_newline);
  }

  fn indent(&self) -> Option<Indent> {
    match (self.indent, self.indent_size) {
      (Some(Indent::Tabs), _) => Some(Indent::Tabs),
      (_, Some(size)) => Some(Indent::Spaces(size)),
      _ => None,
    }
  }
}

/// A parsed manifest file.
#[derive(Debug)]
pub struct ManifestDocument {
  path: PathBuf,
  format: DocumentFormat,
  contents: Value,
  yaml_header: bool,
  style: TextStyle,
  dirty: bool,
  /// `(alias pointer, anchor pointer)` pairs, YAML only.
  aliases: Vec<(String, String)>,
  locations: HashMap<FragmentKey, Vec<String>>,
}

impl ManifestDocument {
  /// Read and parse `path`, refusing files larger than `max_size` bytes.
  pub fn read(path: &Path, max_size: u64) -> Result<Self, LoadError> {
    let metadata = fs::metadata(path).map_err(|e| io_error(path, e))?;
    if metadata.len() > max_size {
      return Err(LoadError::TooLarge {
        path: path.to_path_buf(),
        size: metadata.len(),
        limit: max_size,
      });
    }

    let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    Self::parse(path, &text)
  }

  /// Parse already-read text as the document at `path`.
  pub fn parse(path: &Path, text: &str) -> Result<Self, LoadError> {
    let format = DocumentFormat::from_path(path);
    let parse_error = |message: String| LoadError::Parse {
      path: path.to_path_buf(),
      message,
    };

    let (contents, yaml_header, aliases) = match format {
      DocumentFormat::Json => {
        let contents: Value = serde_json::from_str(&normalize_json(text)).map_err(|e| parse_error(e.to_string()))?;
        (contents, false, Vec::new())
      }
      DocumentFormat::Yaml => {
        let contents: Value = serde_yaml::from_str(text).map_err(|e| parse_error(e.to_string()))?;
        let header = text.lines().find(|l| !l.trim().is_empty() && !l.starts_with('#'));
        (contents, header.is_some_and(|l| l.trim_end() == "---"), yaml_alias_sites(path, text))
      }
    };

    let style = resolve_style(path, format, text);
    debug!(path = %path.display(), ?format, ?style, "parsed manifest");

    Ok(Self {
      path: path.to_path_buf(),
      format,
      contents,
      yaml_header,
      style,
      dirty: false,
      aliases,
      locations: HashMap::new(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn format(&self) -> DocumentFormat {
    self.format
  }

  pub fn contents(&self) -> &Value {
    &self.contents
  }

  pub fn style(&self) -> TextStyle {
    self.style
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  /// The pointer of the node `pointer` was parsed from.
  ///
  /// Differs from `pointer` only when the path passes through a YAML alias.
  pub fn canonical_pointer(&self, pointer: &str) -> String {
    let mut current = pointer.to_string();
    // each step moves to an earlier anchor, so this terminates
    for _ in 0..=self.aliases.len() {
      let Some((alias, anchor)) = self.aliases.iter().find(|(alias, _)| is_pointer_prefix(alias, &current)) else {
        break;
      };
      current = format!("{}{}", anchor, &current[alias.len()..]);
    }
    current
  }

  /// Remember that the fragment `key` lives at JSON pointer `pointer`.
  pub(crate) fn record_fragment(&mut self, key: FragmentKey, pointer: String) {
    let pointers = self.locations.entry(key).or_default();
    if !pointers.contains(&pointer) {
      pointers.push(pointer);
    }
  }

  pub(crate) fn fragment_locations(&self, key: &FragmentKey) -> &[String] {
    self.locations.get(key).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Apply `edit` to every occurrence of the fragment and mark the document dirty.
  pub(crate) fn edit_fragment<E>(
    &mut self,
    key: &FragmentKey,
    mut edit: impl FnMut(&mut Map<String, Value>) -> Result<(), E>,
  ) -> Result<(), E> {
    let pointers = self.locations.get(key).cloned().unwrap_or_default();
    for pointer in pointers {
      if let Some(Value::Object(fragment)) = self.contents.pointer_mut(&pointer) {
        edit(fragment)?;
        self.dirty = true;
      }
    }
    Ok(())
  }

  /// Serialize the document in its original style.
  pub fn render(&self) -> Result<String, UpdateError> {
    let serialize_error = |message: String| UpdateError::Serialize {
      path: self.path.clone(),
      message,
    };

    let mut text = match self.format {
      DocumentFormat::Json => {
        let indent = match self.style.indent {
          Indent::Tabs => "\t".to_string(),
          Indent::Spaces(n) => " ".repeat(n),
        };
        let mut buf = Vec::new();
        let formatter = PrettyFormatter::with_indent(indent.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self
          .contents
          .serialize(&mut serializer)
          .map_err(|e| serialize_error(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| serialize_error(e.to_string()))?
      }
      DocumentFormat::Yaml => {
        let body = serde_yaml::to_string(&self.contents).map_err(|e| serialize_error(e.to_string()))?;
        if self.yaml_header { format!("---\n{}", body) } else { body }
      }
    };

    let trimmed_len = text.trim_end_matches('\n').len();
    text.truncate(trimmed_len);
    if self.style.final_newline {
      text.push('\n');
    }
    Ok(text)
  }

  /// Write the document back to its path.
  pub fn write(&mut self) -> Result<(), UpdateError> {
    let text = self.render()?;
    fs::write(&self.path, text).map_err(|source| UpdateError::Io {
      path: self.path.clone(),
      source,
    })?;
    self.dirty = false;
    Ok(())
  }
}

fn io_error(path: &Path, err: std::io::Error) -> LoadError {
  if err.kind() == ErrorKind::NotFound {
    LoadError::NotFound { path: path.to_path_buf() }
  } else {
    LoadError::Io {
      path: path.to_path_buf(),
      source: err,
    }
  }
}

/// Strip `//` and `/* */` comments outside strings and escape raw control
/// characters inside strings.
pub fn normalize_json(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut chars = text.chars().peekable();
  let mut in_string = false;

  while let Some(c) = chars.next() {
    if in_string {
      match c {
        '\\' => {
          out.push(c);
          if let Some(escaped) = chars.next() {
            out.push(escaped);
          }
        }
        '"' => {
          in_string = false;
          out.push(c);
        }
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        _ => out.push(c),
      }
      continue;
    }

    match c {
      '"' => {
        in_string = true;
        out.push(c);
      }
      '/' if chars.peek() == Some(&'/') => {
        while chars.peek().is_some_and(|&n| n != '\n') {
          chars.next();
        }
      }
      '/' if chars.peek() == Some(&'*') => {
        chars.next();
        let mut prev = '\0';
        for n in chars.by_ref() {
          if prev == '*' && n == '/' {
            break;
          }
          prev = n;
        }
      }
      _ => out.push(c),
    }
  }

  out
}

fn detect_indent(text: &str) -> Option<Indent> {
  text.lines().find_map(|line| {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.len() == line.len() {
      return None;
    }
    let ws = &line[..line.len() - trimmed.len()];
    if ws.starts_with('\t') {
      Some(Indent::Tabs)
    } else {
      Some(Indent::Spaces(ws.len()))
    }
  })
}

fn resolve_style(path: &Path, format: DocumentFormat, text: &str) -> TextStyle {
  let config = lookup_editorconfig(path);
  let default_indent = match format {
    DocumentFormat::Json => Indent::Spaces(4),
    DocumentFormat::Yaml => Indent::Spaces(2),
  };
  TextStyle {
    indent: config.indent().or_else(|| detect_indent(text)).unwrap_or(default_indent),
    final_newline: config.insert_final_newline.unwrap_or_else(|| text.ends_with('\n')),
  }
}

/// Collect editorconfig settings for `path`, walking up until `root = true`.
///
/// Closer files win over files in parent directories.
pub fn lookup_editorconfig(path: &Path) -> EditorConfig {
  let mut result = EditorConfig::default();
  let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
    return result;
  };

  let absolute = absolute_parent(path);
  let mut dir = absolute.as_deref();
  while let Some(current) = dir {
    if let Ok(text) = fs::read_to_string(current.join(".editorconfig")) {
      let (config, is_root) = parse_editorconfig(&text, filename);
      result.fill_from(config);
      if is_root {
        break;
      }
    }
    dir = current.parent();
  }

  result
}

fn absolute_parent(path: &Path) -> Option<PathBuf> {
  let parent = path.parent()?;
  if parent.as_os_str().is_empty() {
    return std::env::current_dir().ok();
  }
  dunce::canonicalize(parent).ok().or_else(|| Some(parent.to_path_buf()))
}

/// Parse one `.editorconfig` file for `filename`. Returns the settings and
/// whether the file declares `root = true`.
fn parse_editorconfig(text: &str, filename: &str) -> (EditorConfig, bool) {
  let mut config = EditorConfig::default();
  let mut is_root = false;
  let mut in_preamble = true;
  let mut section_matches = false;

  for raw in text.lines() {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
      continue;
    }
    if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
      in_preamble = false;
      section_matches = glob_matches(section, filename);
      continue;
    }
    let Some((key, value)) = line.split_once('=') else {
      continue;
    };
    let key = key.trim().to_ascii_lowercase();
    let value = value.trim().to_ascii_lowercase();

    if in_preamble {
      if key == "root" {
        is_root = value == "true";
      }
      continue;
    }
    if !section_matches {
      continue;
    }

    // later sections override earlier ones within a file
    match key.as_str() {
      "indent_style" => {
        config.indent = match value.as_str() {
          "tab" => Some(Indent::Tabs),
          "space" => Some(Indent::Spaces(0)),
          _ => config.indent,
        }
      }
      "indent_size" => {
        if let Ok(size) = value.parse() {
          config.indent_size = Some(size);
        }
      }
      "insert_final_newline" => match value.as_str() {
        "true" => config.insert_final_newline = Some(true),
        "false" => config.insert_final_newline = Some(false),
        _ => {}
      },
      _ => {}
    }
  }

  (config, is_root)
}

/// Match an editorconfig section glob against a bare filename.
fn glob_matches(pattern: &str, filename: &str) -> bool {
  let pattern = pattern.rsplit('/').next().unwrap_or(pattern);
  match Glob::new(pattern) {
    Ok(glob) => glob.compile_matcher().is_match(filename),
    Err(err) => {
      debug!(pattern = %pattern, error = %err, "ignoring editorconfig section");
      false
    }
  }
}

fn is_pointer_prefix(prefix: &str, pointer: &str) -> bool {
  pointer
    .strip_prefix(prefix)
    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// An `&anchor` or `*alias` token in YAML text.
#[derive(Debug, PartialEq, Eq)]
struct YamlRef {
  start: usize,
  end: usize,
  anchor: bool,
  name: String,
}

/// Find anchor and alias tokens outside quoted scalars and comments.
fn scan_yaml_refs(text: &str) -> Vec<YamlRef> {
  let mut refs = Vec::new();
  let mut offset = 0;
  for line in text.split_inclusive('\n') {
    let mut quote: Option<char> = None;
    let mut prev = ' ';
    let mut chars = line.char_indices();
    while let Some((i, c)) = chars.next() {
      match quote {
        Some('"') if c == '\\' => {
          chars.next();
        }
        Some(q) if c == q => quote = None,
        Some(_) => {}
        None => {
          let at_node_start = prev.is_whitespace() || matches!(prev, '[' | '{' | ',');
          match c {
            '#' if prev.is_whitespace() => break,
            '"' | '\'' if at_node_start => quote = Some(c),
            '&' | '*' if at_node_start => {
              let name: String = line[i + 1..]
                .chars()
                .take_while(|ch| !ch.is_whitespace() && !matches!(ch, ',' | '[' | ']' | '{' | '}'))
                .collect();
              if !name.is_empty() {
                refs.push(YamlRef {
                  start: offset + i,
                  end: offset + i + 1 + name.len(),
                  anchor: c == '&',
                  name,
                });
              }
            }
            _ => {}
          }
        }
      }
      prev = c;
    }
    offset += line.len();
  }
  refs
}

/// Locate YAML aliases as `(alias pointer, anchor pointer)` pairs.
///
/// The parser expands aliases, so the text is parsed a second time with every
/// anchor and alias replaced by a numbered tag that survives into the value.
fn yaml_alias_sites(path: &Path, text: &str) -> Vec<(String, String)> {
  let refs = scan_yaml_refs(text);
  let mut defined: HashMap<&str, usize> = HashMap::new();
  let mut tagged = String::with_capacity(text.len());
  let mut last = 0;
  let mut has_alias = false;

  for (n, token) in refs.iter().enumerate() {
    let replacement = if token.anchor {
      defined.insert(token.name.as_str(), n);
      format!("!{}{}", ANCHOR_TAG, n)
    } else if let Some(anchor) = defined.get(token.name.as_str()) {
      has_alias = true;
      format!("!{}{} null", ALIAS_TAG, anchor)
    } else {
      continue;
    };
    tagged.push_str(&text[last..token.start]);
    tagged.push_str(&replacement);
    last = token.end;
  }
  if !has_alias {
    return Vec::new();
  }
  tagged.push_str(&text[last..]);

  let value: serde_yaml::Value = match serde_yaml::from_str(&tagged) {
    Ok(value) => value,
    Err(err) => {
      debug!(path = %path.display(), error = %err, "cannot locate YAML aliases, treating every node as distinct");
      return Vec::new();
    }
  };

  let mut anchors: HashMap<usize, String> = HashMap::new();
  let mut aliases: Vec<(String, usize)> = Vec::new();
  collect_tags(&value, String::new(), &mut anchors, &mut aliases);

  aliases
    .into_iter()
    .filter_map(|(pointer, n)| anchors.get(&n).map(|anchor| (pointer, anchor.clone())))
    .collect()
}

fn collect_tags(
  value: &serde_yaml::Value,
  pointer: String,
  anchors: &mut HashMap<usize, String>,
  aliases: &mut Vec<(String, usize)>,
) {
  match value {
    serde_yaml::Value::Tagged(tagged) => {
      let tag = tagged.tag.to_string();
      let tag = tag.trim_start_matches('!');
      if let Some(n) = tag.strip_prefix(ALIAS_TAG).and_then(|n| n.parse().ok()) {
        aliases.push((pointer, n));
        return;
      }
      if let Some(n) = tag.strip_prefix(ANCHOR_TAG).and_then(|n| n.parse().ok()) {
        anchors.entry(n).or_insert_with(|| pointer.clone());
      }
      collect_tags(&tagged.value, pointer, anchors, aliases);
    }
    serde_yaml::Value::Sequence(items) => {
      for (i, item) in items.iter().enumerate() {
        collect_tags(item, format!("{}/{}", pointer, i), anchors, aliases);
      }
    }
    serde_yaml::Value::Mapping(map) => {
      for (key, item) in map {
        let key = match key {
          serde_yaml::Value::String(s) => s.clone(),
          serde_yaml::Value::Number(n) => n.to_string(),
          serde_yaml::Value::Bool(b) => b.to_string(),
          _ => continue,
        };
        collect_tags(item, format!("{}/{}", pointer, escape_pointer(&key)), anchors, aliases);
      }
    }
    _ => {}
  }
}
