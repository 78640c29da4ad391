use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{drain_changes, QueryState};
use crate::cache::{CacheResult, Fetcher, Payload, QueryKey};
use crate::client::{QueryClient, Subscription};
use crate::error::{QueryError, Result};
use crate::executor::QueryOptions;
use crate::scheduler::TimerHandle;

type Arrival = (u64, QueryKey, Result<CacheResult<Value>>);

/// A query whose key changes rapidly (search boxes, filters).
///
/// Only a key left unchanged for the whole debounce window is fetched. A result for
/// a key that has since been replaced is dropped when it arrives.
pub struct DebouncedQuery<T> {
  client: QueryClient,
  fetcher: Fetcher,
  options: QueryOptions,
  window: Duration,
  state: QueryState<T>,
  /// Key whose result `state` shows
  key: Option<QueryKey>,
  /// Latest key passed to `set_key`
  pending: Option<QueryKey>,
  seen: Option<Value>,
  generation: u64,
  _timer: Option<TimerHandle>,
  tx: mpsc::UnboundedSender<Arrival>,
  rx: mpsc::UnboundedReceiver<Arrival>,
  changes: broadcast::Receiver<QueryKey>,
  _subscription: Option<Subscription>,
}

impl<T: Payload> DebouncedQuery<T> {
  pub fn new(client: &QueryClient, fetcher: Fetcher, window: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      client: client.clone(),
      fetcher,
      options: QueryOptions::default(),
      window,
      state: QueryState::Idle,
      key: None,
      pending: None,
      seen: None,
      generation: 0,
      _timer: None,
      tx,
      rx,
      changes: client.changes(),
      _subscription: None,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.state.error()
  }

  pub fn key(&self) -> Option<&QueryKey> {
    self.key.as_ref()
  }

  /// Whether a key change is still waiting for its window or its fetch.
  pub fn is_pending(&self) -> bool {
    self.pending.is_some() && self.pending != self.key
  }

  /// Replace the key and restart the debounce window.
  pub fn set_key(&mut self, key: impl Into<QueryKey>) {
    let key = key.into();
    self.generation += 1;
    self.pending = Some(key.clone());
    if self.state.is_idle() {
      self.state = QueryState::Loading;
    }

    let generation = self.generation;
    let client = self.client.clone();
    let fetcher = self.fetcher.clone();
    let options = self.options.clone();
    let tx = self.tx.clone();

    // Replacing the handle cancels the previous window.
    self._timer = Some(self.client.scheduler().after(self.window, move || {
      debug!(key = %key, "Debounce window elapsed, fetching");
      let scheduler = client.scheduler().clone();
      scheduler.spawn(async move {
        let result = client.fetch(&key, fetcher, &options).await;
        let _ = tx.send((generation, key, result));
      });
    }));
  }

  /// Apply arrived results and background refreshes. Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    while let Ok((generation, key, result)) = self.rx.try_recv() {
      if generation != self.generation {
        debug!(key = %key, "Discarding result for superseded key");
        continue;
      }

      if self.key.as_ref() != Some(&key) {
        self._subscription = Some(self.client.subscribe(&key));
        self.key = Some(key);
      }
      match result {
        Ok(hit) => {
          self.seen = Some(hit.data.clone());
          self.state = QueryState::from_result(Ok(hit.data));
        }
        Err(e) => self.state = QueryState::Error(e),
      }
      changed = true;
    }

    let touched = match &self.key {
      Some(key) => drain_changes(&mut self.changes, key),
      None => false,
    };
    if touched && !self.is_pending() {
      changed |= self.sync_from_entry();
    }
    changed
  }

  fn sync_from_entry(&mut self) -> bool {
    let Some(entry) = self.key.as_ref().and_then(|key| self.client.get_entry(key)) else {
      return false;
    };
    match QueryState::from_entry(&entry) {
      Some(state) if entry.data != self.seen || state.is_error() != self.state.is_error() => {
        self.seen = entry.data;
        self.state = state;
        true
      }
      _ => false,
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for DebouncedQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DebouncedQuery")
      .field("key", &self.key)
      .field("pending", &self.pending)
      .field("state", &self.state)
      .field("window", &self.window)
      .finish_non_exhaustive()
  }
}
