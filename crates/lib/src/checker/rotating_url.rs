//! Checker for links that redirect to a versioned download.
//!
//! ```json
//! "x-checker-data": {
//!   "type": "rotating-url",
//!   "url": "https://example.com/latest",
//!   "pattern": "https://example.com/app-([0-9.]+)\\.tar\\.gz"
//! }
//! ```

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::checker::{CheckContext, Checker, CheckerError, set_new_version, wrong_content_types};
use crate::consts::FILE_URL_SCHEMES;
use crate::external::{CheckResult, ExternalSource, ExternalState, SourceKind, State};

#[derive(Debug, Default, Clone, Copy)]
pub struct RotatingUrlChecker;

#[async_trait]
impl Checker for RotatingUrlChecker {
  fn name(&self) -> &'static str {
    "rotating-url"
  }

  fn priority(&self) -> i32 {
    50
  }

  fn data_type(&self) -> Option<&'static str> {
    Some("rotating-url")
  }

  fn schema(&self, _kind: SourceKind) -> Option<Value> {
    Some(json!({
      "type": "object",
      "properties": {
        "url": {"type": "string"},
        "pattern": {"type": "string", "format": "regex"}
      },
      "required": ["url"]
    }))
  }

  async fn check(&self, ctx: &CheckContext<'_>, source: &ExternalSource, result: &mut CheckResult) -> Result<(), CheckerError> {
    let data = source.checker_data();
    let url = data
      .get("url")
      .and_then(Value::as_str)
      .ok_or_else(|| CheckerError::metadata("missing \"url\""))?;
    let scheme = reqwest::Url::parse(url)
      .map_err(|e| CheckerError::metadata(format!("invalid URL {}: {}", url, e)))?
      .scheme()
      .to_string();
    if !FILE_URL_SCHEMES.contains(&scheme.as_str()) {
      return Err(CheckerError::metadata(format!("invalid URL scheme {}", scheme)));
    }
    let pattern = data
      .get("pattern")
      .and_then(Value::as_str)
      .map(|p| Regex::new(p).map_err(|e| CheckerError::metadata(e.to_string())))
      .transpose()?;

    debug!(source = %source, url = %url, "resolving rotating url");
    let info = ctx
      .http
      .file_info(url, wrong_content_types(source.kind()))
      .await
      .map_err(CheckerError::from_fetch)?;

    if let Some(current) = source.current_version().as_file()
      && current.checksum.matches(&info.checksum).unwrap_or(false)
    {
      debug!(source = %source, url = %url, "still serving the pinned file");
      result.state = State::Valid;
      return Ok(());
    }

    let version = match pattern {
      Some(re) => {
        let captures = re
          .captures(&info.url)
          .ok_or_else(|| CheckerError::query(format!("{} does not match pattern {}", info.url, re.as_str())))?;
        let version = captures
          .get(1)
          .ok_or_else(|| CheckerError::metadata(format!("pattern {} has no capture group", re.as_str())))?;
        Some(version.as_str().to_string())
      }
      None => None,
    };

    set_new_version(ctx, source, result, ExternalState::File(info.with_version(version))).await
  }
}
