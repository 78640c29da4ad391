use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use super::{drain_changes, QueryState};
use crate::cache::{CacheResult, CacheSource, Fetcher, Payload, QueryKey};
use crate::client::{QueryClient, Subscription};
use crate::error::{QueryError, Result};
use crate::executor::QueryOptions;

/// Async query bound to one cache key.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a [`Fetcher`])
/// - Loading/success/error states decoded into `T`
/// - Async result handling via channels
/// - A subscription that keeps the entry alive and picks up background refreshes
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  fetcher: Fetcher,
  options: QueryOptions,
  state: QueryState<T>,
  source: Option<CacheSource>,
  fetched_at: Option<DateTime<Utc>>,
  /// Raw payload behind `state`, to tell real entry changes from echoes of our own fetch
  seen: Option<Value>,
  receiver: Option<mpsc::UnboundedReceiver<Result<CacheResult<Value>>>>,
  changes: broadcast::Receiver<QueryKey>,
  _subscription: Subscription,
}

impl<T: Payload> Query<T> {
  /// Create a query for `key`. Nothing is fetched until [`Query::fetch`].
  pub fn new(client: &QueryClient, key: impl Into<QueryKey>, fetcher: Fetcher) -> Self {
    let key = key.into();
    Self {
      client: client.clone(),
      changes: client.changes(),
      _subscription: client.subscribe(&key),
      key,
      fetcher,
      options: QueryOptions::default(),
      state: QueryState::Idle,
      source: None,
      fetched_at: None,
      seen: None,
      receiver: None,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  /// Loading with nothing to show. A refresh of existing data is [`Query::is_fetching`].
  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.state.error()
  }

  /// `(data, loading, error)` in one call, for render code.
  pub fn result(&self) -> (Option<&T>, bool, Option<&QueryError>) {
    (self.data(), self.is_loading(), self.error())
  }

  /// Where the current data came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.fetched_at
  }

  /// Read through the cache. No-op while a fetch from this handle is pending.
  ///
  /// Returns whether a new fetch was started.
  pub fn fetch(&mut self) -> bool {
    if self.receiver.is_some() {
      return false;
    }
    let client = self.client.clone();
    let key = self.key.clone();
    let fetcher = self.fetcher.clone();
    let options = self.options.clone();
    self.start(async move { client.fetch(&key, fetcher, &options).await });
    true
  }

  /// Fetch again, bypassing staleness. A pending result from this handle is dropped.
  pub fn refetch(&mut self) {
    self.receiver = None;
    let client = self.client.clone();
    let key = self.key.clone();
    let fetcher = self.fetcher.clone();
    let options = self.options.clone();
    self.start(async move {
      let data = client.refetch(&key, fetcher, &options).await?;
      let fetched_at = client.get_entry(&key).and_then(|e| e.fetched_at);
      Ok(CacheResult::from_network(data, fetched_at))
    });
  }

  /// Poll for a pending result and for changes made to the entry elsewhere.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(result) => {
          self.receiver = None;
          self.apply(result);
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => {}
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Task aborted by dispose before it could send
          self.receiver = None;
          self.state = QueryState::Error(QueryError::Disposed);
          changed = true;
        }
      }
    }

    if drain_changes(&mut self.changes, &self.key) && self.receiver.is_none() {
      changed |= self.sync_from_entry();
    }
    changed
  }

  fn start<F>(&mut self, fut: F)
  where
    F: std::future::Future<Output = Result<CacheResult<Value>>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if !self.state.is_success() {
      self.state = QueryState::Loading;
    }

    self.client.scheduler().spawn(async move {
      // Ignore send errors - the handle may have been dropped
      let _ = tx.send(fut.await);
    });
  }

  fn apply(&mut self, result: Result<CacheResult<Value>>) {
    match result {
      Ok(hit) => {
        self.source = Some(hit.source);
        self.fetched_at = hit.fetched_at;
        self.seen = Some(hit.data.clone());
        self.state = QueryState::from_result(Ok(hit.data));
      }
      Err(e) => self.state = QueryState::Error(e),
    }
  }

  /// Pick up a background refresh or an error recorded by another caller.
  fn sync_from_entry(&mut self) -> bool {
    let Some(entry) = self.client.get_entry(&self.key) else {
      return false;
    };
    let Some(state) = QueryState::from_entry(&entry) else {
      return false;
    };
    if entry.fetched_at == self.fetched_at
      && entry.data == self.seen
      && state.is_error() == self.state.is_error()
    {
      return false;
    }

    if state.is_success() {
      self.source = Some(CacheSource::Network);
    }
    self.fetched_at = entry.fetched_at;
    self.seen = entry.data;
    self.state = state;
    true
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher, typed_fetcher, KeyPattern};
  use crate::clock::ManualClock;
  use crate::executor::RetryPolicy;
  use crate::invalidation::InvalidationRule;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn client() -> QueryClient {
    QueryClient::builder()
      .clock(ManualClock::default())
      .retry(RetryPolicy::none())
      .build()
  }

  fn counter(delay: Duration) -> (Arc<AtomicU32>, Fetcher) {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let f = typed_fetcher(move |_| {
      let c = c.clone();
      async move {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(delay).await;
        Ok(n)
      }
    });
    (calls, f)
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_success() {
    let client = client();
    let mut query: Query<Vec<i32>> = Query::new(
      &client,
      "numbers",
      typed_fetcher(|_| async { Ok(vec![1, 2, 3]) }),
    );

    assert!(query.state().is_idle());

    query.fetch();
    assert!(query.is_loading());

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
    assert_eq!(query.source(), Some(CacheSource::Network));
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_error() {
    let client = client();
    let mut query: Query<i32> = Query::new(
      &client,
      "broken",
      fetcher(|_| async { Err(QueryError::transient("Something went wrong")) }),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    let (data, loading, error) = query.result();
    assert!(data.is_none());
    assert!(!loading);
    assert_eq!(error, Some(&QueryError::transient("Something went wrong")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_while_fetching_is_noop() {
    let client = client();
    let (calls, f) = counter(Duration::from_millis(100));
    let mut query: Query<u32> = Query::new(&client, "slow", f);

    query.fetch();
    query.fetch();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(query.poll());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_second_query_reads_cache() {
    let client = client();
    let (calls, f) = counter(Duration::from_millis(10));
    let mut first: Query<u32> = Query::new(&client, "user:1", f.clone());
    first.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.poll();

    let mut second: Query<u32> = Query::new(&client, "user:1", f);
    second.fetch();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(second.poll());
    assert_eq!(second.data(), Some(&1));
    assert_eq!(second.source(), Some(CacheSource::CacheFresh));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_bypasses_staleness() {
    let client = client();
    let (calls, f) = counter(Duration::from_millis(10));
    let mut query: Query<u32> = Query::new(&client, "user:1", f);

    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();

    query.refetch();
    assert_eq!(query.data(), Some(&1));
    assert!(query.is_fetching());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(query.poll());
    assert_eq!(query.data(), Some(&2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_updates_subscribed_query_in_place() {
    let client = client();
    let (calls, f) = counter(Duration::from_millis(10));
    let mut query: Query<u32> = Query::new(&client, "user:1", f);
    client.register_rule(
      "user.updated",
      InvalidationRule::new().immediate(KeyPattern::prefix("user")),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();
    assert_eq!(query.data(), Some(&1));

    let report = client.invalidate("user.updated", None);
    assert_eq!(report.refetched, 1);
    assert!(!query.poll());
    assert_eq!(query.data(), Some(&1));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(query.poll());
    assert_eq!(query.data(), Some(&2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_decode_mismatch_surfaces_validation_error() {
    let client = client();
    let mut query: Query<Vec<String>> = Query::new(
      &client,
      "shape",
      fetcher(|_| async { Ok(json!({"not": "a list"})) }),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(1)).await;
    query.poll();

    assert!(matches!(query.error(), Some(QueryError::Validation(_))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropping_query_releases_subscription() {
    let client = client();
    let key = QueryKey::parse("user:1");
    let query: Query<u32> = Query::new(&client, key.clone(), counter(Duration::ZERO).1);
    assert_eq!(client.get_entry(&key).unwrap().subscriber_count, 1);

    drop(query);
    assert_eq!(client.get_entry(&key).unwrap().subscriber_count, 0);
  }
}
