//! Constants shared across the crate.

use std::time::Duration;

/// Checker-data flag marking the source whose version goes into release metadata.
pub const MAIN_SRC_PROP: &str = "is-main-source";

/// Checker-data flag marking a source whose update justifies rewriting the manifest.
pub const IMPORTANT_SRC_PROP: &str = "is-important";

/// Checker-data key naming the id of the source that must be checked first.
pub const PARENT_ID_PROP: &str = "parent-id";

/// Checker-data key selecting a checker.
pub const CHECKER_TYPE_PROP: &str = "type";

/// Manifest key holding the checker configuration of a source.
pub const CHECKER_DATA_KEY: &str = "x-checker-data";

/// Default cap on the size of any manifest file we read (100 KiB).
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 100;

/// Connect timeout for every network operation.
pub const TIMEOUT_CONNECT: Duration = Duration::from_secs(5);

/// Total timeout for every network operation.
pub const TIMEOUT_TOTAL: Duration = Duration::from_secs(60);

/// User agent sent with every request; some mirrors reject the default one.
pub const USER_AGENT: &str = concat!("extcheck/", env!("CARGO_PKG_VERSION"));

/// Content types that mean a "file" URL served an error page instead.
pub const WRONG_CONTENT_TYPES_FILE: &[&str] = &["text/html"];

/// Content types that mean an "archive" URL served an error page instead.
pub const WRONG_CONTENT_TYPES_ARCHIVE: &[&str] = &["text/html", "application/xhtml+xml", "text/plain"];

/// URL schemes a checker may fetch a file source from.
pub const FILE_URL_SCHEMES: &[&str] = &["http", "https"];
