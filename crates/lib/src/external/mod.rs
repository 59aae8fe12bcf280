//! The data model of a checked manifest.
//!
//! - `types`: resolved file and git versions
//! - `source`: sources, their kinds and check state
//! - `module`: build modules owning sources

pub mod module;
pub mod source;
pub mod types;

pub use module::{Module, ModuleId};
pub use source::{CheckResult, ExternalSource, SourceKind, SourceLoadError, State};
pub use types::{ExternalFile, ExternalGitRef, ExternalState};
