//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::key::QueryKey;
use crate::error::{QueryError, Result};

/// Trait for values that consumer interfaces can cache.
///
/// Entries are stored as JSON, so anything that round-trips through serde qualifies.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Encode a typed value into the stored representation.
pub fn encode<T: Payload>(value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|e| QueryError::Validation(e.to_string()))
}

/// Decode a stored value back into a typed payload.
pub fn decode<T: Payload>(value: &Value) -> Result<T> {
  serde_json::from_value(value.clone()).map_err(|e| QueryError::Validation(e.to_string()))
}

/// The fetch collaborator: produces the payload for a key.
pub type Fetcher = Arc<dyn Fn(QueryKey) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Box an async closure into a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  Arc::new(move |key| Box::pin(f(key)))
}

/// Box an async closure producing a typed payload into a [`Fetcher`].
pub fn typed_fetcher<T, F, Fut>(f: F) -> Fetcher
where
  T: Payload,
  F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move |key| {
    let fut = f(key);
    Box::pin(async move { encode(&fut.await?) })
  })
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched
  pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
    }
  }

  pub fn from_cache(data: T, fetched_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      fetched_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      fetched_at: self.fetched_at,
    }
  }

  pub fn is_hit(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// Indicates where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched (or joined an in-flight fetch) for this read
  Network,
  /// From cache, still fresh
  CacheFresh,
  /// From cache, stale; a background refetch was issued
  CacheStale,
}
