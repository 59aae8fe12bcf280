//! Resolved versions of external artifacts.
//!
//! Both types are immutable values: every `with_*` helper returns a modified
//! copy, so a pinned version and a candidate can always be compared side by side.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checksum::{DigestError, MultiDigest};

/// A resolved file, archive or extra-data download.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalFile {
  pub url: String,
  pub checksum: MultiDigest,
  pub size: Option<u64>,
  pub version: Option<String>,
  pub timestamp: Option<DateTime<Utc>>,
  pub changelog_url: Option<String>,
}

impl ExternalFile {
  pub fn new(url: impl Into<String>, checksum: MultiDigest) -> Self {
    Self {
      url: url.into(),
      checksum,
      size: None,
      version: None,
      timestamp: None,
      changelog_url: None,
    }
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = url.into();
    self
  }

  pub fn with_checksum(mut self, checksum: MultiDigest) -> Self {
    self.checksum = checksum;
    self
  }

  pub fn with_size(mut self, size: Option<u64>) -> Self {
    self.size = size;
    self
  }

  pub fn with_version(mut self, version: Option<String>) -> Self {
    self.version = version;
    self
  }

  pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
    self.timestamp = timestamp;
    self
  }

  pub fn with_changelog_url(mut self, changelog_url: Option<String>) -> Self {
    self.changelog_url = changelog_url;
    self
  }

  /// Same URL and same content on the strongest shared digest.
  pub fn same_artifact(&self, other: &ExternalFile) -> Result<bool, DigestError> {
    Ok(self.url == other.url && self.checksum.matches(&other.checksum)?)
  }
}

/// A resolved git reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalGitRef {
  pub url: String,
  pub commit: Option<String>,
  pub tag: Option<String>,
  pub branch: Option<String>,
  pub version: Option<String>,
  pub timestamp: Option<DateTime<Utc>>,
}

impl ExternalGitRef {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      commit: None,
      tag: None,
      branch: None,
      version: None,
      timestamp: None,
    }
  }

  pub fn with_commit(mut self, commit: Option<String>) -> Self {
    self.commit = commit;
    self
  }

  pub fn with_tag(mut self, tag: Option<String>) -> Self {
    self.tag = tag;
    self
  }

  pub fn with_branch(mut self, branch: Option<String>) -> Self {
    self.branch = branch;
    self
  }

  pub fn with_version(mut self, version: Option<String>) -> Self {
    self.version = version;
    self
  }

  pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
    self.timestamp = timestamp;
    self
  }

  /// Whether both refs name the same thing.
  ///
  /// Tags take precedence over branches, branches over commits.
  pub fn matches(&self, other: &ExternalGitRef) -> bool {
    if self.url != other.url {
      return false;
    }
    if self.tag.is_some() || other.tag.is_some() {
      return self.tag == other.tag;
    }
    if self.branch.is_some() || other.branch.is_some() {
      return self.branch == other.branch;
    }
    self.commit == other.commit
  }
}

/// A version of a source: either a downloadable file or a git ref.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExternalState {
  File(ExternalFile),
  Git(ExternalGitRef),
}

impl ExternalState {
  pub fn url(&self) -> &str {
    match self {
      ExternalState::File(f) => &f.url,
      ExternalState::Git(g) => &g.url,
    }
  }

  pub fn version(&self) -> Option<&str> {
    match self {
      ExternalState::File(f) => f.version.as_deref(),
      ExternalState::Git(g) => g.version.as_deref(),
    }
  }

  pub fn timestamp(&self) -> Option<DateTime<Utc>> {
    match self {
      ExternalState::File(f) => f.timestamp,
      ExternalState::Git(g) => g.timestamp,
    }
  }

  pub fn as_file(&self) -> Option<&ExternalFile> {
    match self {
      ExternalState::File(f) => Some(f),
      ExternalState::Git(_) => None,
    }
  }

  pub fn as_git(&self) -> Option<&ExternalGitRef> {
    match self {
      ExternalState::Git(g) => Some(g),
      ExternalState::File(_) => None,
    }
  }

  /// Whether `candidate` differs from `self` in a way worth writing back.
  ///
  /// Files differ when the URL changes or the content does; incomparable
  /// digests count as a change. Git refs differ when they no longer match or
  /// point at another commit.
  pub fn differs_from(&self, candidate: &ExternalState) -> bool {
    match (self, candidate) {
      (ExternalState::File(current), ExternalState::File(new)) => !current.same_artifact(new).unwrap_or(false),
      (ExternalState::Git(current), ExternalState::Git(new)) => !current.matches(new) || current.commit != new.commit,
      _ => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checksum::DigestKind;

  fn git(url: &str) -> ExternalGitRef {
    ExternalGitRef::new(url)
  }

  mod git_matching {
    use super::*;

    #[test]
    fn different_urls_never_match() {
      let a = git("https://a").with_tag(Some("v1".into()));
      let b = git("https://b").with_tag(Some("v1".into()));
      assert!(!a.matches(&b));
    }

    #[test]
    fn tag_decides_when_either_has_one() {
      let a = git("https://a").with_tag(Some("v1".into())).with_commit(Some("aaa".into()));
      let b = git("https://a").with_tag(Some("v1".into())).with_commit(Some("bbb".into()));
      assert!(a.matches(&b));

      let c = git("https://a").with_commit(Some("aaa".into()));
      assert!(!a.matches(&c));
    }

    #[test]
    fn branch_decides_without_tags() {
      let a = git("https://a").with_branch(Some("main".into()));
      let b = git("https://a").with_branch(Some("main".into())).with_commit(Some("x".into()));
      assert!(a.matches(&b));
      assert!(!a.matches(&git("https://a").with_branch(Some("dev".into()))));
    }

    #[test]
    fn commit_decides_last() {
      let a = git("https://a").with_commit(Some("x".into()));
      assert!(a.matches(&git("https://a").with_commit(Some("x".into()))));
      assert!(!a.matches(&git("https://a").with_commit(Some("y".into()))));
    }
  }

  mod version_changes {
    use super::*;

    fn file(url: &str, sha: &str) -> ExternalState {
      ExternalState::File(ExternalFile::new(url, MultiDigest::new().with(DigestKind::Sha256, sha)))
    }

    #[test]
    fn identical_file_is_unchanged() {
      assert!(!file("https://x/a", "aa").differs_from(&file("https://x/a", "aa")));
    }

    #[test]
    fn new_url_or_digest_is_a_change() {
      assert!(file("https://x/a", "aa").differs_from(&file("https://x/b", "aa")));
      assert!(file("https://x/a", "aa").differs_from(&file("https://x/a", "bb")));
    }

    #[test]
    fn git_commit_change_is_a_change() {
      let current = ExternalState::Git(git("https://a").with_tag(Some("v1".into())).with_commit(Some("x".into())));
      let moved = ExternalState::Git(git("https://a").with_tag(Some("v1".into())).with_commit(Some("y".into())));
      assert!(current.differs_from(&moved));
      assert!(!current.differs_from(&current.clone()));
    }
  }

  #[test]
  fn with_helpers_return_modified_copies() {
    let original = ExternalFile::new("https://x/a", MultiDigest::new().with(DigestKind::Sha256, "aa"));
    let updated = original.clone().with_url("https://x/b").with_version(Some("2.0".into())).with_size(Some(3));
    assert_eq!(original.url, "https://x/a");
    assert_eq!(original.version, None);
    assert_eq!(updated.url, "https://x/b");
    assert_eq!(updated.version.as_deref(), Some("2.0"));
    assert_eq!(updated.size, Some(3));
  }
}
