//! Multi-algorithm digests for external files.
//!
//! This module provides:
//! - `DigestKind`: the supported algorithms, ordered weakest to strongest
//! - `MultiDigest`: at most one hex digest per algorithm, compared on the
//!   strongest algorithm both sides share
//! - `MultiHash`: computes every supported digest in a single pass

use std::collections::BTreeMap;
use std::fmt;

use md5::Md5;
use serde::Serialize;
use serde_json::{Map, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// A digest algorithm. Variant order is strength order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
  Md5,
  Sha1,
  Sha256,
  Sha512,
}

impl DigestKind {
  /// All algorithms, weakest first.
  pub const ALL: [DigestKind; 4] = [DigestKind::Md5, DigestKind::Sha1, DigestKind::Sha256, DigestKind::Sha512];

  /// The manifest key holding a digest of this kind.
  pub fn as_str(self) -> &'static str {
    match self {
      DigestKind::Md5 => "md5",
      DigestKind::Sha1 => "sha1",
      DigestKind::Sha256 => "sha256",
      DigestKind::Sha512 => "sha512",
    }
  }
}

impl fmt::Display for DigestKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Errors raised when two digest sets cannot be related.
#[derive(Debug, Clone, Error)]
pub enum DigestError {
  /// Neither side has an algorithm the other has.
  #[error("no common digest type for {left} and {right}")]
  NoCommonDigest { left: String, right: String },
}

/// A set of hex digests, at most one per algorithm.
///
/// There is intentionally no `PartialEq`: two sets without a shared algorithm
/// cannot be compared, and [`MultiDigest::matches`] reports that as an error.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct MultiDigest {
  digests: BTreeMap<DigestKind, String>,
}

impl MultiDigest {
  pub fn new() -> Self {
    Self::default()
  }

  /// Return a copy with the digest for `kind` set to `hex` (lowercased).
  pub fn with(mut self, kind: DigestKind, hex: impl Into<String>) -> Self {
    self.digests.insert(kind, hex.into().to_ascii_lowercase());
    self
  }

  pub fn get(&self, kind: DigestKind) -> Option<&str> {
    self.digests.get(&kind).map(String::as_str)
  }

  /// Algorithms present, weakest first.
  pub fn kinds(&self) -> impl DoubleEndedIterator<Item = DigestKind> + '_ {
    self.digests.keys().copied()
  }

  pub fn is_empty(&self) -> bool {
    self.digests.is_empty()
  }

  /// The strongest algorithm present in both sets.
  pub fn strongest_common(&self, other: &MultiDigest) -> Option<DigestKind> {
    self.kinds().rev().find(|kind| other.digests.contains_key(kind))
  }

  /// Whether the two sets share at least one algorithm.
  pub fn shares_kind_with(&self, other: &MultiDigest) -> bool {
    self.strongest_common(other).is_some()
  }

  /// Compare on the strongest algorithm present in both sets.
  pub fn matches(&self, other: &MultiDigest) -> Result<bool, DigestError> {
    let kind = self.strongest_common(other).ok_or_else(|| DigestError::NoCommonDigest {
      left: self.to_string(),
      right: other.to_string(),
    })?;
    Ok(self.digests[&kind] == other.digests[&kind])
  }

  /// Read every known digest key from a source fragment.
  ///
  /// Returns `None` if the fragment declares no digest at all.
  pub fn from_source(source: &Map<String, Value>) -> Option<Self> {
    let digest = DigestKind::ALL.iter().fold(MultiDigest::new(), |acc, kind| {
      match source.get(kind.as_str()).and_then(Value::as_str) {
        Some(hex) => acc.with(*kind, hex),
        None => acc,
      }
    });
    (!digest.is_empty()).then_some(digest)
  }

  /// Overwrite the digests a fragment already declares with ours.
  ///
  /// Only algorithms present in both are written, so the fragment keeps its
  /// original digest types.
  pub fn update_source(&self, source: &mut Map<String, Value>) -> Result<(), DigestError> {
    let to_update: Vec<(DigestKind, &String)> = self
      .digests
      .iter()
      .filter(|(kind, _)| source.contains_key(kind.as_str()))
      .map(|(kind, hex)| (*kind, hex))
      .collect();

    if to_update.is_empty() {
      return Err(DigestError::NoCommonDigest {
        left: self.to_string(),
        right: Value::Object(source.clone()).to_string(),
      });
    }

    for (kind, hex) in to_update {
      source.insert(kind.as_str().to_string(), Value::String(hex.clone()));
    }
    Ok(())
  }
}

impl fmt::Display for MultiDigest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self.digests.iter().map(|(kind, hex)| format!("{}:{}", kind, hex)).collect();
    write!(f, "[{}]", parts.join(", "))
  }
}

/// Computes md5, sha1, sha256 and sha512 in one pass over the data.
#[derive(Default)]
pub struct MultiHash {
  md5: Md5,
  sha1: Sha1,
  sha256: Sha256,
  sha512: Sha512,
}

impl MultiHash {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(&mut self, data: &[u8]) {
    self.md5.update(data);
    self.sha1.update(data);
    self.sha256.update(data);
    self.sha512.update(data);
  }

  pub fn finalize(self) -> MultiDigest {
    MultiDigest::new()
      .with(DigestKind::Md5, hex::encode(self.md5.finalize()))
      .with(DigestKind::Sha1, hex::encode(self.sha1.finalize()))
      .with(DigestKind::Sha256, hex::encode(self.sha256.finalize()))
      .with(DigestKind::Sha512, hex::encode(self.sha512.finalize()))
  }
}

/// Hash a byte slice with every supported algorithm.
pub fn hash_bytes(data: &[u8]) -> MultiDigest {
  let mut hasher = MultiHash::new();
  hasher.update(data);
  hasher.finalize()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
  const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

  mod matching {
    use super::*;

    #[test]
    fn is_reflexive() {
      let digest = hash_bytes(b"hello world");
      assert!(digest.matches(&digest).unwrap());
    }

    #[test]
    fn is_symmetric() {
      let a = MultiDigest::new().with(DigestKind::Sha256, "aa").with(DigestKind::Md5, "11");
      let b = MultiDigest::new().with(DigestKind::Sha256, "bb");
      assert_eq!(a.matches(&b).unwrap(), b.matches(&a).unwrap());
      assert!(!a.matches(&b).unwrap());
    }

    #[test]
    fn uses_strongest_common_algorithm() {
      // md5 agrees but sha256 differs: sha256 decides
      let a = MultiDigest::new().with(DigestKind::Md5, "11").with(DigestKind::Sha256, "aa");
      let b = MultiDigest::new().with(DigestKind::Md5, "11").with(DigestKind::Sha256, "bb");
      assert_eq!(a.strongest_common(&b), Some(DigestKind::Sha256));
      assert!(!a.matches(&b).unwrap());
    }

    #[test]
    fn weaker_common_algorithm_is_used_when_strongest_missing() {
      let a = MultiDigest::new().with(DigestKind::Sha1, "ff").with(DigestKind::Sha512, "aa");
      let b = MultiDigest::new().with(DigestKind::Sha1, "ff").with(DigestKind::Sha256, "bb");
      assert!(a.matches(&b).unwrap());
    }

    #[test]
    fn no_common_algorithm_is_an_error() {
      let a = MultiDigest::new().with(DigestKind::Md5, "11");
      let b = MultiDigest::new().with(DigestKind::Sha256, "aa");
      assert!(matches!(a.matches(&b), Err(DigestError::NoCommonDigest { .. })));
      assert!(matches!(b.matches(&a), Err(DigestError::NoCommonDigest { .. })));
    }

    #[test]
    fn hex_is_case_insensitive() {
      let a = MultiDigest::new().with(DigestKind::Sha256, "ABCDEF");
      let b = MultiDigest::new().with(DigestKind::Sha256, "abcdef");
      assert!(a.matches(&b).unwrap());
    }
  }

  mod source_fragments {
    use super::*;

    #[test]
    fn from_source_reads_known_keys() {
      let source = json!({"type": "file", "sha256": "aa", "md5": "11", "url": "x"});
      let digest = MultiDigest::from_source(source.as_object().unwrap()).unwrap();
      assert_eq!(digest.get(DigestKind::Sha256), Some("aa"));
      assert_eq!(digest.get(DigestKind::Md5), Some("11"));
      assert_eq!(digest.get(DigestKind::Sha1), None);
    }

    #[test]
    fn from_source_without_digest_is_none() {
      let source = json!({"type": "file", "url": "x"});
      assert!(MultiDigest::from_source(source.as_object().unwrap()).is_none());
    }

    #[test]
    fn update_source_only_touches_declared_kinds() {
      let mut source = json!({"type": "file", "sha256": "old"});
      let digest = hash_bytes(b"hello world");
      digest.update_source(source.as_object_mut().unwrap()).unwrap();
      assert_eq!(source["sha256"], HELLO_SHA256);
      assert!(source.get("md5").is_none());
      assert!(source.get("sha512").is_none());
    }

    #[test]
    fn update_source_without_common_kind_fails() {
      let mut source = json!({"type": "file", "sha512": "old"});
      let digest = MultiDigest::new().with(DigestKind::Sha256, "aa");
      let result = digest.update_source(source.as_object_mut().unwrap());
      assert!(result.is_err());
      assert_eq!(source["sha512"], "old");
    }
  }

  #[test]
  fn multihash_computes_all_kinds() {
    let digest = hash_bytes(b"hello world");
    assert_eq!(digest.get(DigestKind::Sha256), Some(HELLO_SHA256));
    assert_eq!(digest.get(DigestKind::Md5), Some(HELLO_MD5));
    assert_eq!(digest.kinds().count(), 4);
    assert_eq!(digest.get(DigestKind::Sha512).map(str::len), Some(128));
  }

  #[test]
  fn multihash_is_streaming() {
    let mut hasher = MultiHash::new();
    hasher.update(b"hello ");
    hasher.update(b"world");
    assert_eq!(hasher.finalize().get(DigestKind::Sha256), Some(HELLO_SHA256));
  }
}
