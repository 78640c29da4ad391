//! JSON-over-HTTP fetch collaborator.

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::cache::{fetcher, Fetcher, KeyPart, QueryKey};
use crate::config::HttpConfig;
use crate::error::{QueryError, Result};

/// Build the HTTP client described by `config`.
pub fn client(config: &HttpConfig) -> Result<reqwest::Client> {
  reqwest::Client::builder()
    .timeout(Duration::from_millis(config.timeout_ms))
    .user_agent(config.user_agent.as_str())
    .build()
    .map_err(|e| QueryError::transient(format!("Failed to build HTTP client: {}", e)))
}

/// Cache key for a URL: `http:<host>[:port]:<path segments...>[:?query]`.
pub fn url_key(url: &Url) -> QueryKey {
  let host = match (url.host_str(), url.port()) {
    (Some(host), Some(port)) => format!("{}:{}", host, port),
    (Some(host), None) => host.to_string(),
    (None, _) => String::new(),
  };

  let mut parts = vec![KeyPart::from("http"), KeyPart::Str(host)];
  if let Some(segments) = url.path_segments() {
    parts.extend(
      segments
        .filter(|s| !s.is_empty())
        .map(|s| KeyPart::Str(s.to_string())),
    );
  }
  if let Some(query) = url.query() {
    parts.push(KeyPart::Str(format!("?{}", query)));
  }
  QueryKey::new(parts)
}

/// Fetcher that GETs `url` and parses the body as JSON.
///
/// Transport failures and non-success statuses are transient; an unparseable body
/// is a validation error.
pub fn json_fetcher(http: reqwest::Client, url: Url) -> Fetcher {
  fetcher(move |_key| {
    let http = http.clone();
    let url = url.clone();
    async move {
      let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| QueryError::transient(format!("GET {} failed: {}", url, e)))?;

      let status = response.status();
      let body = response
        .text()
        .await
        .map_err(|e| QueryError::transient(format!("Failed to read body of {}: {}", url, e)))?;
      parse_response(&url, status, &body)
    }
  })
}

/// Map a response to a payload: non-success statuses are transient, bad JSON is invalid.
fn parse_response(url: &Url, status: StatusCode, body: &str) -> Result<Value> {
  if !status.is_success() {
    return Err(QueryError::transient(format!("GET {} returned {}", url, status)));
  }
  Ok(serde_json::from_str::<Value>(body)?)
}
