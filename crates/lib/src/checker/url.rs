//! Plain reachability check for file-like sources.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::checker::{CheckContext, Checker, CheckerError};
use crate::external::{CheckResult, ExternalSource, State};

/// Marks a source `Valid` if its pinned URL answers, `Broken` otherwise.
///
/// Has no type tag, so it only runs as a fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlChecker;

#[async_trait]
impl Checker for UrlChecker {
  fn name(&self) -> &'static str {
    "url"
  }

  fn priority(&self) -> i32 {
    100
  }

  async fn check(&self, ctx: &CheckContext<'_>, source: &ExternalSource, result: &mut CheckResult) -> Result<(), CheckerError> {
    let url = source.current_version().url();
    match ctx.http.check_reachable(url).await {
      Ok(()) => {
        debug!(source = %source, url = %url, "url reachable");
        result.state = State::Valid;
      }
      Err(err) => {
        warn!(source = %source, error = %err, "url unreachable");
        result.state = State::Broken;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::HttpClient;
  use crate::manifest::{CheckerOptions, ManifestChecker};
  use serde_json::json;
  use std::fs;
  use tempfile::TempDir;

  async fn run(url: String) -> CheckResult {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s.json");
    fs::write(&path, json!({"type": "file", "url": url, "sha256": "aa"}).to_string()).unwrap();
    let manifest = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();
    let source = manifest.external_data(None).remove(0);

    let options = CheckerOptions::default();
    let http = HttpClient::from_options(&options).unwrap();
    let ctx = CheckContext { http: &http, options: &options };
    let mut result = CheckResult::default();
    UrlChecker.check(&ctx, &source, &mut result).await.unwrap();
    result
  }

  #[tokio::test]
  async fn reachable_url_is_valid() {
    let mut server = mockito::Server::new_async().await;
    let _ok = server.mock("HEAD", "/a.tar").with_status(200).create_async().await;
    assert_eq!(run(format!("{}/a.tar", server.url())).await.state, State::Valid);
  }

  #[tokio::test]
  async fn missing_url_is_broken() {
    let mut server = mockito::Server::new_async().await;
    let _gone = server.mock("HEAD", "/a.tar").with_status(404).create_async().await;
    let result = run(format!("{}/a.tar", server.url())).await;
    assert_eq!(result.state, State::Broken);
    assert!(result.new_version.is_none());
  }
}
