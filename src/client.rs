//! The query client: one explicit cache instance shared by every consumer.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::{
  encode, CacheEntry, CacheResult, CacheStore, DurableStore, Fetcher, KeyPattern, Payload,
  PersistenceAdapter, ProfileTable, QueryKey,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::executor::{ExecutorParts, QueryExecutor, QueryOptions, RetryPolicy};
use crate::invalidation::{InvalidationEngine, InvalidationReport, InvalidationRule};
use crate::prefetch::{PrefetchOrchestrator, Relation};
use crate::scheduler::{Scheduler, TimerHandle, VisibilityHub};

/// Snapshot of cache health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
  /// Entries that have been fetched or seeded. Placeholders created by a subscription
  /// or a pending first fetch are not counted.
  pub total_queries: usize,
  /// Entries with at least one subscriber, placeholders included
  pub active_queries: usize,
  /// Entries holding data that is stale or invalidated
  pub stale_queries: usize,
  /// Reads served from cache
  pub hits: u64,
  /// Reads that had to wait for a fetch (including joined in-flight fetches)
  pub misses: u64,
  /// `hits / (hits + misses)`, 0.0 before the first read
  pub hit_rate: f64,
}

/// Builder for [`QueryClient`].
pub struct ClientBuilder {
  clock: Arc<dyn Clock>,
  profiles: ProfileTable,
  retry: RetryPolicy,
  gc_interval: Duration,
  persistence: Option<(Arc<dyn DurableStore>, Vec<KeyPattern>)>,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self {
      clock: Arc::new(SystemClock),
      profiles: ProfileTable::default(),
      retry: RetryPolicy::default(),
      gc_interval: Duration::from_secs(60),
      persistence: None,
    }
  }
}

impl ClientBuilder {
  pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  pub fn profiles(mut self, profiles: ProfileTable) -> Self {
    self.profiles = profiles;
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn gc_interval(mut self, interval: Duration) -> Self {
    self.gc_interval = interval;
    self
  }

  /// Mirror keys matching `patterns` into `store`.
  pub fn persist(mut self, store: Arc<dyn DurableStore>, patterns: Vec<KeyPattern>) -> Self {
    self.persistence = Some((store, patterns));
    self
  }

  /// Build the client. Must be called inside a tokio runtime.
  pub fn build(self) -> QueryClient {
    let scheduler = Scheduler::new();
    let prefetch = Arc::new(PrefetchOrchestrator::new());
    let persistence = self
      .persistence
      .map(|(store, patterns)| PersistenceAdapter::new(store, patterns));

    let executor = QueryExecutor::new(ExecutorParts {
      store: CacheStore::new(self.clock),
      scheduler,
      profiles: self.profiles,
      default_retry: self.retry,
      persistence,
      prefetch: prefetch.clone(),
    });

    QueryClient {
      inner: Arc::new(ClientInner {
        invalidation: InvalidationEngine::new(executor.clone()),
        executor,
        prefetch,
        visibility: VisibilityHub::new(),
        gc_interval: self.gc_interval,
        gc_timer: Mutex::new(None),
      }),
    }
  }
}

struct ClientInner {
  executor: QueryExecutor,
  invalidation: InvalidationEngine,
  prefetch: Arc<PrefetchOrchestrator>,
  visibility: VisibilityHub,
  gc_interval: Duration,
  gc_timer: Mutex<Option<TimerHandle>>,
}

/// Entry point to the engine. Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<ClientInner>,
}

impl QueryClient {
  pub fn builder() -> ClientBuilder {
    ClientBuilder::default()
  }

  /// Build a client from configuration, opening the SQLite store if persistence is enabled.
  pub fn from_config(config: &CacheConfig) -> Result<Self> {
    let mut builder = Self::builder()
      .profiles(config.profile_table())
      .retry(config.retry.policy())
      .gc_interval(config.gc_interval());

    if config.persistence.enabled {
      let store = config.persistence.open_store()?;
      builder = builder.persist(Arc::new(store), config.persistence.patterns()?);
    }

    Ok(builder.build())
  }

  /// Start the periodic eviction sweep.
  pub fn init(&self) {
    let mut timer = self
      .inner
      .gc_timer
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if timer.is_none() {
      let executor = self.inner.executor.clone();
      *timer = Some(self.inner.executor.scheduler().every(self.inner.gc_interval, move || {
        executor.sweep();
      }));
      info!(interval = ?self.inner.gc_interval, "Query client initialized");
    }
  }

  /// Cancel every timer and background task. Later fetches fail with `Disposed`.
  pub fn dispose(&self) {
    self
      .inner
      .gc_timer
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    self.inner.invalidation.cancel_all();
    self.inner.executor.scheduler().dispose();
    debug!("Query client disposed");
  }

  /// Flush pending persistence writes, then dispose.
  pub async fn shutdown(&self) {
    self.flush().await;
    self.dispose();
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.executor.scheduler().is_disposed()
  }

  pub fn executor(&self) -> &QueryExecutor {
    &self.inner.executor
  }

  pub fn scheduler(&self) -> &Scheduler {
    self.inner.executor.scheduler()
  }

  pub fn visibility(&self) -> &VisibilityHub {
    &self.inner.visibility
  }

  /// Cache-aware read (stale-while-revalidate).
  pub async fn fetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
    options: &QueryOptions,
  ) -> Result<CacheResult<Value>> {
    self.inner.executor.fetch(key, fetcher, options).await
  }

  /// Fetch bypassing staleness checks (still deduplicated).
  pub async fn refetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
    options: &QueryOptions,
  ) -> Result<Value> {
    self.inner.executor.execute(key, fetcher, options).await
  }

  pub fn register_rule(&self, event: impl Into<String>, rule: InvalidationRule) {
    self.inner.invalidation.register(event, rule);
  }

  pub fn invalidate(&self, event: &str, payload: Option<&Value>) -> InvalidationReport {
    self.inner.invalidation.invalidate(event, payload)
  }

  /// Delayed invalidations still waiting to fire.
  pub fn pending_invalidations(&self) -> usize {
    self.inner.invalidation.pending()
  }

  /// Hard-remove entries matching `pattern`, or everything for `None`.
  pub fn clear(&self, pattern: Option<&KeyPattern>) -> usize {
    self.inner.invalidation.clear(pattern)
  }

  pub fn register_relation(&self, kind: impl Into<String>, relation: Relation) {
    self.inner.prefetch.register(kind, relation);
  }

  pub fn prefetch_related(&self, kind: &str, data: &Value) -> usize {
    self
      .inner
      .prefetch
      .prefetch_related(&self.inner.executor, kind, data)
  }

  /// Seed an entry by hand, e.g. for an optimistic update.
  pub fn set_entry(&self, key: &QueryKey, data: Value) {
    self.inner.executor.set_entry(key, data);
  }

  pub fn set_entry_as<T: Payload>(&self, key: &QueryKey, data: &T) -> Result<()> {
    self.set_entry(key, encode(data)?);
    Ok(())
  }

  pub fn get_entry(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.inner.executor.get_entry(key)
  }

  pub fn stats(&self) -> CacheStats {
    let reads = self.inner.executor.read_stats();
    self.inner.executor.with_store(|store| {
      let now = store.now();
      let total = reads.hits + reads.misses;
      CacheStats {
        total_queries: store.entries().filter(|e| e.fetched_at.is_some()).count(),
        active_queries: store.entries().filter(|e| e.has_subscribers()).count(),
        stale_queries: store
          .entries()
          .filter(|e| e.data.is_some() && e.is_stale(now))
          .count(),
        hits: reads.hits,
        misses: reads.misses,
        hit_rate: if total == 0 {
          0.0
        } else {
          reads.hits as f64 / total as f64
        },
      }
    })
  }

  /// Register interest in `key`. The entry is kept through sweeps until dropped.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let executor = &self.inner.executor;
    executor.subscribe(key);

    let interval = executor.profiles().resolve(key).refetch_interval.map(|period| {
      let exec = executor.clone();
      let k = key.clone();
      executor.scheduler().every(period, move || {
        exec.refetch_key(&k);
      })
    });

    Subscription {
      key: key.clone(),
      executor: executor.clone(),
      _interval: interval,
    }
  }

  pub fn changes(&self) -> broadcast::Receiver<QueryKey> {
    self.inner.executor.changes()
  }

  /// The host window regained focus: refetch watched, stale entries whose profile asks for it.
  pub fn on_focus(&self) -> usize {
    let executor = &self.inner.executor;
    let keys: Vec<QueryKey> = executor.with_store(|store| {
      let now = store.now();
      store
        .entries()
        .filter(|e| e.has_subscribers() && e.is_stale(now))
        .filter(|e| executor.profiles().resolve(&e.key).refetch_on_focus)
        .map(|e| e.key.clone())
        .collect()
    });
    keys.iter().filter(|key| executor.refetch_key(key)).count()
  }

  pub fn sweep(&self) -> usize {
    self.inner.executor.sweep().len()
  }

  /// Wait for queued persistence writes.
  pub async fn flush(&self) {
    if let Some(persistence) = self.inner.executor.persistence() {
      persistence.flush().await;
    }
  }
}

/// A consumer's interest in a key. Dropping it releases the entry to the sweep.
pub struct Subscription {
  key: QueryKey,
  executor: QueryExecutor,
  _interval: Option<TimerHandle>,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.executor.unsubscribe(&self.key);
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("key", &self.key).finish()
  }
}
