//! Checker for git sources.
//!
//! Every git source goes through this checker:
//! - with `x-checker-data.type = "git"` the newest tag matching `tag-pattern`
//!   becomes the candidate version
//! - otherwise the pinned tag or branch is resolved again and compared with
//!   the pinned commit

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info};
use version_compare::Cmp;

use crate::checker::{CheckContext, Checker, CheckerError, schema, set_new_version};
use crate::external::{CheckResult, ExternalGitRef, ExternalSource, ExternalState, SourceKind, State};
use crate::git::{self, GitError};

pub const DEFAULT_TAG_PATTERN: &str = r"^(?:[vV])?((?:\d+\.)+\d+)$";

const TAGS_PREFIX: &str = "refs/tags/";
const PEELED_SUFFIX: &str = "^{}";

#[derive(Debug, Default, Clone, Copy)]
pub struct GitChecker;

#[async_trait]
impl Checker for GitChecker {
  fn name(&self) -> &'static str {
    "git"
  }

  fn priority(&self) -> i32 {
    95
  }

  fn data_type(&self) -> Option<&'static str> {
    Some("git")
  }

  fn supported_kinds(&self) -> &'static [SourceKind] {
    &[SourceKind::Git]
  }

  fn should_check(&self, source: &ExternalSource) -> bool {
    source.kind() == SourceKind::Git
  }

  fn schema(&self, _kind: SourceKind) -> Option<Value> {
    Some(json!({
      "type": "object",
      "properties": {
        "tag-pattern": {"type": "string", "format": "regex"},
        "version-scheme": {"type": "string", "enum": ["loose", "semantic"]},
        "sort-tags": {"type": "boolean"}
      }
    }))
  }

  fn validate(&self, source: &ExternalSource) -> Result<(), CheckerError> {
    if source.checker_type() != self.data_type() {
      return Ok(());
    }
    match self.schema(source.kind()) {
      Some(schema) => schema::validate(&schema, source.checker_data())
        .map_err(|e| CheckerError::metadata(format!("{}: {}", source.id(), e))),
      None => Ok(()),
    }
  }

  async fn check(&self, ctx: &CheckContext<'_>, source: &ExternalSource, result: &mut CheckResult) -> Result<(), CheckerError> {
    let Some(current) = source.current_version().as_git() else {
      return Err(CheckerError::metadata(format!("{} is not a git source", source.id())));
    };

    if source.checker_type() == self.data_type() {
      self.check_new_version(ctx, source, current, result).await
    } else {
      self.check_still_valid(ctx, source, current, result).await
    }
  }
}

impl GitChecker {
  async fn check_new_version(
    &self,
    ctx: &CheckContext<'_>,
    source: &ExternalSource,
    current: &ExternalGitRef,
    result: &mut CheckResult,
  ) -> Result<(), CheckerError> {
    let data = source.checker_data();
    let pattern = data.get("tag-pattern").and_then(Value::as_str).unwrap_or(DEFAULT_TAG_PATTERN);
    let pattern = Regex::new(pattern).map_err(|e| CheckerError::metadata(e.to_string()))?;
    if pattern.captures_len() != 2 {
      return Err(CheckerError::metadata(format!(
        "tag-pattern {} must have exactly one capture group",
        pattern.as_str()
      )));
    }
    let sort_tags = data.get("sort-tags").and_then(Value::as_bool).unwrap_or(true);
    let scheme = VersionScheme::from_data(data);

    let refs = git::ls_remote(&current.url, &[], ctx.options.total_timeout)
      .await
      .map_err(|e| git_error(e, CheckerError::query))?;

    let latest = latest_tag(&refs, &pattern, sort_tags.then_some(scheme))
      .ok_or_else(|| CheckerError::query(format!("no tag in {} matches {}", current.url, pattern.as_str())))?;
    debug!(source = %source, tag = %latest.tag, version = %latest.version, "latest matching tag");

    let candidate = ExternalGitRef::new(current.url.clone())
      .with_tag(Some(latest.tag))
      .with_commit(Some(latest.commit))
      .with_version(Some(latest.version));
    set_new_version(ctx, source, result, ExternalState::Git(candidate)).await
  }

  async fn check_still_valid(
    &self,
    ctx: &CheckContext<'_>,
    source: &ExternalSource,
    current: &ExternalGitRef,
    result: &mut CheckResult,
  ) -> Result<(), CheckerError> {
    let Some(pinned) = current.commit.as_deref() else {
      info!(source = %source, "not pinned to a commit, skipping");
      return Ok(());
    };
    let wanted = match (&current.tag, &current.branch) {
      (Some(tag), _) => vec![format!("{}{}", TAGS_PREFIX, tag), format!("{}{}{}", TAGS_PREFIX, tag, PEELED_SUFFIX)],
      (None, Some(branch)) => vec![format!("refs/heads/{}", branch)],
      (None, None) => {
        debug!(source = %source, "pinned to a bare commit, nothing to verify");
        return Ok(());
      }
    };

    let patterns: Vec<&str> = wanted.iter().map(String::as_str).collect();
    let refs = git::ls_remote(&current.url, &patterns, ctx.options.total_timeout)
      .await
      .map_err(|e| git_error(e, CheckerError::fetch))?;

    let remote = resolve_ref(&refs, current)
      .ok_or_else(|| CheckerError::query(format!("{} not found in {}", wanted[0], current.url)))?;

    if remote == pinned {
      result.state = State::Valid;
      return Ok(());
    }

    info!(source = %source, pinned = %pinned, remote = %remote, "ref moved");
    let candidate = current.clone().with_commit(Some(remote.to_string()));
    set_new_version(ctx, source, result, ExternalState::Git(candidate)).await
  }
}

fn git_error(err: GitError, otherwise: fn(String) -> CheckerError) -> CheckerError {
  match err {
    GitError::Timeout { .. } => CheckerError::Timeout { message: err.to_string() },
    other => otherwise(other.to_string()),
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TagMatch {
  tag: String,
  commit: String,
  version: String,
}

/// Tags of `refs` as `tag -> commit`, preferring the peeled commit of
/// annotated tags.
fn tag_commits(refs: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
  let mut tags = BTreeMap::new();
  for (name, commit) in refs {
    let Some(tag) = name.strip_prefix(TAGS_PREFIX) else {
      continue;
    };
    match tag.strip_suffix(PEELED_SUFFIX) {
      Some(tag) => {
        tags.insert(tag, commit.as_str());
      }
      None => {
        tags.entry(tag).or_insert(commit.as_str());
      }
    }
  }
  tags
}

/// The newest tag matching `pattern`, whose first capture group is the version.
///
/// Without a scheme the last tag in ref name order wins.
fn latest_tag(refs: &BTreeMap<String, String>, pattern: &Regex, sort: Option<VersionScheme>) -> Option<TagMatch> {
  let mut matches: Vec<TagMatch> = tag_commits(refs)
    .into_iter()
    .filter_map(|(tag, commit)| {
      let version = pattern.captures(tag)?.get(1)?.as_str().to_string();
      Some(TagMatch {
        tag: tag.to_string(),
        commit: commit.to_string(),
        version,
      })
    })
    .collect();

  if let Some(scheme) = sort {
    matches.retain(|m| scheme.parses(&m.version));
    matches.sort_by(|a, b| scheme.compare(&a.version, &b.version));
  }
  matches.pop()
}

/// The commit the pinned tag or branch of `current` points at remotely.
fn resolve_ref<'a>(refs: &'a BTreeMap<String, String>, current: &ExternalGitRef) -> Option<&'a str> {
  if let Some(tag) = &current.tag {
    let peeled = format!("{}{}{}", TAGS_PREFIX, tag, PEELED_SUFFIX);
    let plain = format!("{}{}", TAGS_PREFIX, tag);
    return refs.get(&peeled).or_else(|| refs.get(&plain)).map(String::as_str);
  }
  let branch = current.branch.as_ref()?;
  refs.get(&format!("refs/heads/{}", branch)).map(String::as_str)
}

/// How tag versions are ordered when `sort-tags` is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionScheme {
  /// Dotted components compared numerically where possible.
  #[default]
  Loose,
  /// Semantic versions; tags that do not parse as one are dropped.
  Semantic,
}

impl VersionScheme {
  fn from_data(data: &serde_json::Map<String, Value>) -> Self {
    match data.get("version-scheme").and_then(Value::as_str) {
      Some("semantic") => VersionScheme::Semantic,
      _ => VersionScheme::Loose,
    }
  }

  fn parses(self, version: &str) -> bool {
    match self {
      VersionScheme::Loose => true,
      VersionScheme::Semantic => semver::Version::parse(version).is_ok(),
    }
  }

  pub fn compare(self, a: &str, b: &str) -> Ordering {
    match self {
      VersionScheme::Loose => match version_compare::compare(a, b) {
        Ok(Cmp::Lt) => Ordering::Less,
        Ok(Cmp::Gt) => Ordering::Greater,
        Ok(_) => Ordering::Equal,
        Err(_) => a.cmp(b),
      },
      VersionScheme::Semantic => match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
      },
    }
  }
}
