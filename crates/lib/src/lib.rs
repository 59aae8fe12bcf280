//! extcheck-lib: Core types and logic for extcheck
//!
//! This crate audits build manifests for stale external sources:
//! - `manifest`: loads a manifest (and the files it references) into modules and sources
//! - `checker`: the pluggable version-discovery strategies and their registry
//! - `check`: runs the checkers concurrently, parents before children
//! - `update`: rewrites manifests to point at newly discovered versions

pub mod check;
pub mod checker;
pub mod checksum;
pub mod consts;
pub mod external;
pub mod git;
pub mod http;
pub mod manifest;
pub mod update;

pub use check::{CheckOutcome, RunError};
pub use checker::{CheckContext, Checker, CheckerError, CheckerRegistry};
pub use checksum::{DigestKind, MultiDigest};
pub use external::{CheckResult, ExternalFile, ExternalGitRef, ExternalSource, ExternalState, Module, SourceKind, State};
pub use manifest::{CheckerOptions, LoadError, ManifestChecker, ManifestKind};
pub use update::UpdateError;
