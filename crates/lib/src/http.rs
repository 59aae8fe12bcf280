//! The shared HTTP session used by every checker in a run.
//!
//! One `HttpClient` is built per run from the connect/total timeouts and
//! handed to checkers read-only. It provides:
//! - `check_reachable()`: does a URL still resolve
//! - `file_info()`: download a URL and describe it as an `ExternalFile`
//! - `hash_url()`: download a URL and compute every digest

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::checksum::{MultiDigest, MultiHash};
use crate::consts::USER_AGENT;
use crate::external::ExternalFile;
use crate::manifest::CheckerOptions;

#[derive(Debug, Error)]
pub enum HttpError {
  #[error("failed to build HTTP client: {message}")]
  Client { message: String },

  #[error("request to {url} failed: {message}")]
  Request { url: String, message: String },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("{url} served unexpected content type {content_type}")]
  ContentType { url: String, content_type: String },

  #[error("request to {url} timed out")]
  Timeout { url: String },
}

impl HttpError {
  fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
    if err.is_timeout() {
      HttpError::Timeout { url: url.to_string() }
    } else if let Some(status) = err.status() {
      HttpError::Status {
        url: url.to_string(),
        status: status.as_u16(),
      }
    } else {
      HttpError::Request {
        url: url.to_string(),
        message: err.to_string(),
      }
    }
  }
}

/// A pooled HTTP client with shared headers and timeouts.
#[derive(Debug, Clone)]
pub struct HttpClient {
  client: Client,
}

impl HttpClient {
  pub fn new(connect_timeout: Duration, total_timeout: Duration) -> Result<Self, HttpError> {
    let client = Client::builder()
      .user_agent(USER_AGENT)
      .connect_timeout(connect_timeout)
      .timeout(total_timeout)
      .build()
      .map_err(|e| HttpError::Client { message: e.to_string() })?;
    Ok(Self { client })
  }

  pub fn from_options(options: &CheckerOptions) -> Result<Self, HttpError> {
    Self::new(options.connect_timeout, options.total_timeout)
  }

  async fn get(&self, url: &str) -> Result<Response, HttpError> {
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| HttpError::from_reqwest(url, e))?;
    response.error_for_status().map_err(|e| HttpError::from_reqwest(url, e))
  }

  /// Whether `url` answers with a success status.
  ///
  /// Falls back to GET when the server refuses HEAD.
  pub async fn check_reachable(&self, url: &str) -> Result<(), HttpError> {
    let response = self
      .client
      .head(url)
      .send()
      .await
      .map_err(|e| HttpError::from_reqwest(url, e))?;

    if matches!(response.status(), StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED) {
      debug!(url = %url, "HEAD refused, retrying with GET");
      self.get(url).await?;
      return Ok(());
    }

    response.error_for_status().map_err(|e| HttpError::from_reqwest(url, e))?;
    Ok(())
  }

  /// Download `url` (following redirects) and describe the result.
  ///
  /// The returned file carries the final URL, every digest, the size and the
  /// `Last-Modified` time when the server sends one. Responses whose media
  /// type, without parameters, equals one of `content_type_deny` ignoring case
  /// are rejected.
  pub async fn file_info(&self, url: &str, content_type_deny: &[&str]) -> Result<ExternalFile, HttpError> {
    let mut response = self.get(url).await?;
    let final_url = response.url().to_string();

    if let Some(content_type) = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
      let mime = content_type.split(';').next().unwrap_or(content_type).trim();
      if content_type_deny.iter().any(|deny| mime.eq_ignore_ascii_case(deny)) {
        return Err(HttpError::ContentType {
          url: final_url,
          content_type: mime.to_string(),
        });
      }
    }

    let timestamp = response
      .headers()
      .get(LAST_MODIFIED)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
      .map(|t| t.with_timezone(&Utc));

    let (checksum, size) = hash_response(url, &mut response).await?;
    debug!(url = %url, final_url = %final_url, size, "downloaded file info");

    Ok(
      ExternalFile::new(final_url, checksum)
        .with_size(Some(size))
        .with_timestamp(timestamp),
    )
  }

  /// Download `url` and compute every digest of its body.
  pub async fn hash_url(&self, url: &str) -> Result<MultiDigest, HttpError> {
    let mut response = self.get(url).await?;
    let (checksum, _) = hash_response(url, &mut response).await?;
    Ok(checksum)
  }
}

async fn hash_response(url: &str, response: &mut Response) -> Result<(MultiDigest, u64), HttpError> {
  let mut hasher = MultiHash::new();
  let mut size: u64 = 0;
  while let Some(chunk) = response.chunk().await.map_err(|e| HttpError::from_reqwest(url, e))? {
    size += chunk.len() as u64;
    hasher.update(&chunk);
  }
  Ok((hasher.finalize(), size))
}
