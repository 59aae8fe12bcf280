//! Adding releases to an application's AppStream metadata.
//!
//! The file is edited as text so that everything outside the inserted
//! `<release>` element stays byte-for-byte as it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AppdataError {
  #[error("no appdata file for {app_id} in {}", dir.display())]
  NotFound { app_id: String, dir: PathBuf },

  #[error("malformed appdata file {}: {message}", path.display())]
  Load { path: PathBuf, message: String },

  #[error("failed to access {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Locate `{app_id}.metainfo.xml` or `{app_id}.appdata.xml` in `dir`.
pub fn find_appdata_file(dir: &Path, app_id: &str) -> Result<PathBuf, AppdataError> {
  for suffix in ["metainfo.xml", "appdata.xml"] {
    let candidate = dir.join(format!("{}.{}", app_id, suffix));
    if candidate.is_file() {
      return Ok(candidate);
    }
  }
  Err(AppdataError::NotFound {
    app_id: app_id.to_string(),
    dir: dir.to_path_buf(),
  })
}

/// Record release `version` dated `date` (`YYYY-MM-DD`) as the newest release.
pub fn add_release(path: &Path, version: &str, date: &str) -> Result<(), AppdataError> {
  let text = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
  let updated = insert_release(&text, version, date).map_err(|message| AppdataError::Load {
    path: path.to_path_buf(),
    message,
  })?;
  if updated == text {
    debug!(path = %path.display(), version = %version, "release already present");
    return Ok(());
  }
  fs::write(path, updated).map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: io::Error) -> AppdataError {
  AppdataError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Insert a `<release>` as the first child of `<releases>`, creating the
/// element before `</component>` when missing. Inserting a version that is
/// already listed returns the text unchanged.
pub(crate) fn insert_release(text: &str, version: &str, date: &str) -> Result<String, String> {
  let component_end = text.rfind("</component>").ok_or("no </component> element")?;
  if !text.contains("<component") {
    return Err("no <component> element".to_string());
  }

  let existing = Regex::new(&format!(r#"<release\b[^>]*\bversion\s*=\s*["']{}["']"#, regex::escape(version)))
    .map_err(|e| e.to_string())?;
  if existing.is_match(text) {
    return Ok(text.to_string());
  }

  let release = format!(r#"<release version="{}" date="{}"/>"#, version, date);
  let releases = Regex::new(r"<releases\b[^>]*?(/?)>").map_err(|e| e.to_string())?;

  let mut out = String::with_capacity(text.len() + release.len() + 32);
  match releases.captures(text) {
    Some(captures) => {
      let tag = captures.get(0).ok_or("unreadable <releases> element")?;
      let parent_indent = line_indent(text, tag.start());
      let unit = indent_unit(parent_indent);
      out.push_str(&text[..tag.start()]);
      if captures.get(1).is_some_and(|slash| !slash.as_str().is_empty()) {
        out.push_str("<releases>\n");
        out.push_str(&format!("{}{}{}\n", parent_indent, unit, release));
        out.push_str(&format!("{}</releases>", parent_indent));
      } else {
        out.push_str(tag.as_str());
        out.push_str(&format!("\n{}{}{}", parent_indent, unit, release));
      }
      out.push_str(&text[tag.end()..]);
    }
    None => {
      let line_start = text[..component_end].rfind('\n').map(|i| i + 1).unwrap_or(0);
      let closing_indent = &text[line_start..component_end];
      let child = if closing_indent.trim().is_empty() {
        format!("{}  ", closing_indent)
      } else {
        "  ".to_string()
      };
      let unit = indent_unit(&child);
      let insert_at = if closing_indent.trim().is_empty() { line_start } else { component_end };
      out.push_str(&text[..insert_at]);
      out.push_str(&format!("{}<releases>\n", child));
      out.push_str(&format!("{}{}{}\n", child, unit, release));
      out.push_str(&format!("{}</releases>\n", child));
      out.push_str(&text[insert_at..]);
    }
  }
  Ok(out)
}

/// Leading whitespace of the line containing byte offset `at`.
fn line_indent(text: &str, at: usize) -> &str {
  let start = text[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
  let line = &text[start..at];
  let trimmed = line.len() - line.trim_start().len();
  &line[..trimmed]
}

fn indent_unit(indent: &str) -> &'static str {
  if indent.starts_with('\t') { "\t" } else { "  " }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const WITH_RELEASES: &str = "\
<?xml version=\"1.0\" encoding=\"UTF-8\"?>
<component type=\"desktop-application\">
  <id>org.example.App</id>
  <releases>
    <release version=\"1.0\" date=\"2023-01-01\"/>
  </releases>
</component>
";

  #[test]
  fn new_release_goes_first() {
    let out = insert_release(WITH_RELEASES, "2.0", "2024-02-03").unwrap();
    assert!(out.contains(
      "  <releases>\n    <release version=\"2.0\" date=\"2024-02-03\"/>\n    <release version=\"1.0\" date=\"2023-01-01\"/>"
    ));
  }

  #[test]
  fn existing_release_is_left_alone() {
    assert_eq!(insert_release(WITH_RELEASES, "1.0", "2024-02-03").unwrap(), WITH_RELEASES);
  }

  #[test]
  fn releases_element_is_created() {
    let text = "<component>\n  <id>org.example.App</id>\n</component>\n";
    let out = insert_release(text, "2.0", "2024-02-03").unwrap();
    assert_eq!(
      out,
      "<component>\n  <id>org.example.App</id>\n  <releases>\n    <release version=\"2.0\" date=\"2024-02-03\"/>\n  </releases>\n</component>\n"
    );
  }

  #[test]
  fn self_closing_releases_is_expanded() {
    let text = "<component>\n  <releases/>\n</component>\n";
    let out = insert_release(text, "2.0", "2024-02-03").unwrap();
    assert_eq!(
      out,
      "<component>\n  <releases>\n    <release version=\"2.0\" date=\"2024-02-03\"/>\n  </releases>\n</component>\n"
    );
  }

  #[test]
  fn missing_component_is_malformed() {
    assert!(insert_release("<foo/>", "2.0", "2024-02-03").is_err());
  }

  #[test]
  fn finds_metainfo_before_appdata() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("org.example.App.appdata.xml"), WITH_RELEASES).unwrap();
    fs::write(dir.path().join("org.example.App.metainfo.xml"), WITH_RELEASES).unwrap();
    let found = find_appdata_file(dir.path(), "org.example.App").unwrap();
    assert!(found.ends_with("org.example.App.metainfo.xml"));
  }

  #[test]
  fn missing_file_is_not_found() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
      find_appdata_file(dir.path(), "org.example.App"),
      Err(AppdataError::NotFound { .. })
    ));
  }

  #[test]
  fn malformed_file_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("org.example.App.appdata.xml");
    fs::write(&path, "not xml").unwrap();
    assert!(matches!(add_release(&path, "2.0", "2024-02-03"), Err(AppdataError::Load { .. })));
  }
}
