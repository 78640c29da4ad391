//! Query executor: deduplicated, retried fetches that settle into the cache store.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{
  CacheEntry, CacheResult, CacheStore, EntryMeta, EntryStatus, Fetcher, KeyPattern,
  PersistenceAdapter, ProfileTable, QueryKey, Refetch,
};
use crate::error::{QueryError, Result};
use crate::prefetch::PrefetchOrchestrator;
use crate::scheduler::Scheduler;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
  Fixed,
  /// `delay * 2^attempt`, capped at `max_delay`
  Exponential,
}

/// Retry behaviour for failed fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt; `count + 1` attempts in total.
  pub count: u32,
  pub delay: Duration,
  pub backoff: Backoff,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      count: 0,
      ..Self::default()
    }
  }

  pub fn fixed(count: u32, delay: Duration) -> Self {
    Self {
      count,
      delay,
      backoff: Backoff::Fixed,
      max_delay: delay,
    }
  }

  pub fn exponential(count: u32, delay: Duration, max_delay: Duration) -> Self {
    Self {
      count,
      delay,
      backoff: Backoff::Exponential,
      max_delay,
    }
  }

  /// Delay before retry number `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    match self.backoff {
      Backoff::Fixed => self.delay,
      Backoff::Exponential => self
        .delay
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(self.max_delay)
        .min(self.max_delay),
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
  }
}

/// Per-call options for [`QueryExecutor::execute`] and [`QueryExecutor::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// Join an identical in-flight request instead of issuing a second fetch.
  pub dedupe: bool,
  /// `None` uses the client's default policy.
  pub retry: Option<RetryPolicy>,
  /// `None` uses the key's strategy profile.
  pub stale_time: Option<Duration>,
  /// `None` uses the key's strategy profile.
  pub gc_time: Option<Duration>,
  /// Serve stale data immediately and refresh it in the background.
  pub background_refetch: bool,
  /// Entity kind handed to the prefetch orchestrator after a successful fetch.
  pub prefetch_kind: Option<String>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      dedupe: true,
      retry: None,
      stale_time: None,
      gc_time: None,
      background_refetch: true,
      prefetch_kind: None,
    }
  }
}

impl QueryOptions {
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }

  pub fn with_dedupe(mut self, dedupe: bool) -> Self {
    self.dedupe = dedupe;
    self
  }

  pub fn with_background_refetch(mut self, enabled: bool) -> Self {
    self.background_refetch = enabled;
    self
  }

  pub fn with_prefetch(mut self, kind: impl Into<String>) -> Self {
    self.prefetch_kind = Some(kind.into());
    self
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

struct InFlight {
  generation: u64,
  future: SharedFetch,
  waiters: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReadStats {
  pub hits: u64,
  pub misses: u64,
}

/// What a read found in the store.
enum Lookup {
  Fresh(Value, Option<chrono::DateTime<chrono::Utc>>),
  Stale(Value, Option<chrono::DateTime<chrono::Utc>>),
  Miss,
}

struct ExecutorInner {
  store: Mutex<CacheStore>,
  inflight: Mutex<HashMap<QueryKey, InFlight>>,
  scheduler: Scheduler,
  profiles: ProfileTable,
  default_retry: RetryPolicy,
  persistence: Option<PersistenceAdapter>,
  prefetch: Arc<PrefetchOrchestrator>,
  changes: broadcast::Sender<QueryKey>,
  stats: Mutex<ReadStats>,
  hydrated: Mutex<HashSet<QueryKey>>,
  next_generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs fetches against the cache store.
///
/// Cloning is cheap; all clones share the same store and in-flight map.
#[derive(Clone)]
pub struct QueryExecutor {
  inner: Arc<ExecutorInner>,
}

pub(crate) struct ExecutorParts {
  pub store: CacheStore,
  pub scheduler: Scheduler,
  pub profiles: ProfileTable,
  pub default_retry: RetryPolicy,
  pub persistence: Option<PersistenceAdapter>,
  pub prefetch: Arc<PrefetchOrchestrator>,
}

impl QueryExecutor {
  pub(crate) fn new(parts: ExecutorParts) -> Self {
    let (changes, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(ExecutorInner {
        store: Mutex::new(parts.store),
        inflight: Mutex::new(HashMap::new()),
        scheduler: parts.scheduler,
        profiles: parts.profiles,
        default_retry: parts.default_retry,
        persistence: parts.persistence,
        prefetch: parts.prefetch,
        changes,
        stats: Mutex::new(ReadStats::default()),
        hydrated: Mutex::new(HashSet::new()),
        next_generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn scheduler(&self) -> &Scheduler {
    &self.inner.scheduler
  }

  pub fn profiles(&self) -> &ProfileTable {
    &self.inner.profiles
  }

  pub(crate) fn persistence(&self) -> Option<&PersistenceAdapter> {
    self.inner.persistence.as_ref()
  }

  pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut CacheStore) -> R) -> R {
    f(&mut lock(&self.inner.store))
  }

  pub(crate) fn read_stats(&self) -> ReadStats {
    *lock(&self.inner.stats)
  }

  /// Receiver for keys whose entry changed.
  pub fn changes(&self) -> broadcast::Receiver<QueryKey> {
    self.inner.changes.subscribe()
  }

  pub(crate) fn notify(&self, key: &QueryKey) {
    let _ = self.inner.changes.send(key.clone());
  }

  /// Number of fetches currently in flight (deduplicated requests only).
  pub fn in_flight(&self) -> usize {
    lock(&self.inner.inflight).len()
  }

  pub(crate) fn meta_for(&self, key: &QueryKey, options: &QueryOptions) -> EntryMeta {
    let profile = self.inner.profiles.resolve(key);
    EntryMeta::new(
      options.stale_time.unwrap_or(profile.stale_time),
      options.gc_time.unwrap_or(profile.gc_time),
    )
  }

  fn ensure_live(&self) -> Result<()> {
    if self.inner.scheduler.is_disposed() {
      Err(QueryError::Disposed)
    } else {
      Ok(())
    }
  }

  /// Fetch `key`, joining an identical in-flight request when `options.dedupe` is set.
  ///
  /// Staleness is not consulted; this always goes to the fetcher (or its in-flight twin).
  pub async fn execute(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
    options: &QueryOptions,
  ) -> Result<Value> {
    self.ensure_live()?;
    self.start(key, fetcher, options).await
  }

  /// Cache-aware read with stale-while-revalidate.
  ///
  /// 1. Fresh data is returned immediately
  /// 2. Stale but unexpired data is returned immediately and, with
  ///    `background_refetch`, refreshed by a non-blocking fetch
  /// 3. Anything else waits for a fetch
  pub async fn fetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
    options: &QueryOptions,
  ) -> Result<CacheResult<Value>> {
    self.ensure_live()?;
    self.hydrate(key, options);

    let lookup = {
      let mut store = lock(&self.inner.store);
      let now = store.now();
      store.set_refetch(
        key,
        Refetch {
          fetcher: fetcher.clone(),
          options: options.clone(),
        },
      );
      match store.get(key) {
        Some(entry) if Self::servable(entry, now) => {
          let data = entry.data.clone().unwrap_or(Value::Null);
          if !entry.is_stale(now) {
            Lookup::Fresh(data, entry.fetched_at)
          } else if options.background_refetch {
            Lookup::Stale(data, entry.fetched_at)
          } else {
            Lookup::Miss
          }
        }
        _ => Lookup::Miss,
      }
    };

    match lookup {
      Lookup::Fresh(data, fetched_at) => {
        lock(&self.inner.stats).hits += 1;
        Ok(CacheResult::from_cache(data, fetched_at, false))
      }
      Lookup::Stale(data, fetched_at) => {
        lock(&self.inner.stats).hits += 1;
        debug!(key = %key, "Serving stale entry, revalidating in background");
        // The fetch runs on its own task; dropping the handle does not cancel it.
        drop(self.start(key, fetcher, options));
        Ok(CacheResult::from_cache(data, fetched_at, true))
      }
      Lookup::Miss => {
        lock(&self.inner.stats).misses += 1;
        let data = self.start(key, fetcher, options).await?;
        let fetched_at = lock(&self.inner.store)
          .get(key)
          .and_then(|e| e.fetched_at);
        Ok(CacheResult::from_network(data, fetched_at))
      }
    }
  }

  fn servable(entry: &CacheEntry, now: chrono::DateTime<chrono::Utc>) -> bool {
    entry.data.is_some() && entry.status != EntryStatus::Error && !entry.is_expired(now)
  }

  /// Restore a persisted mirror the first time a persistent key is read.
  fn hydrate(&self, key: &QueryKey, options: &QueryOptions) {
    let Some(persistence) = self.inner.persistence.as_ref() else {
      return;
    };
    if !persistence.is_persistent(key) || !lock(&self.inner.hydrated).insert(key.clone()) {
      return;
    }

    let meta = self.meta_for(key, options);
    let mut store = lock(&self.inner.store);
    if store.get(key).map_or(false, |e| e.data.is_some()) {
      return;
    }
    if let Some(record) = persistence.load(key, meta.gc_time, store.now()) {
      debug!(key = %key, "Rehydrated persisted entry");
      store.set_at(key, record.data, meta, record.fetched_at);
    }
  }

  /// Start (or join) a fetch. The returned future may be dropped without cancelling it.
  fn start(&self, key: &QueryKey, fetcher: Fetcher, options: &QueryOptions) -> SharedFetch {
    let mut inflight = lock(&self.inner.inflight);
    if options.dedupe {
      if let Some(request) = inflight.get_mut(key) {
        request.waiters += 1;
        debug!(key = %key, waiters = request.waiters, "Joining in-flight request");
        return request.future.clone();
      }
    }

    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
    let prior = {
      let mut store = lock(&self.inner.store);
      store.set_refetch(
        key,
        Refetch {
          fetcher: fetcher.clone(),
          options: options.clone(),
        },
      );
      store.begin_fetch(key)
    };

    let this = self.clone();
    let task_key = key.clone();
    let task_options = options.clone();
    let task = self.inner.scheduler.spawn(async move {
      this
        .run(task_key, fetcher, task_options, prior, generation)
        .await
    });
    let future = async move { task.await.unwrap_or(Err(QueryError::Disposed)) }
      .boxed()
      .shared();

    if options.dedupe {
      inflight.insert(
        key.clone(),
        InFlight {
          generation,
          future: future.clone(),
          waiters: 1,
        },
      );
    }
    drop(inflight);

    self.notify(key);
    future
  }

  async fn run(
    &self,
    key: QueryKey,
    fetcher: Fetcher,
    options: QueryOptions,
    prior: EntryStatus,
    generation: u64,
  ) -> Result<Value> {
    let retry = options.retry.unwrap_or(self.inner.default_retry);
    let mut attempt = 0;

    let result = loop {
      let attempt_result = AssertUnwindSafe(async { fetcher(key.clone()).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(QueryError::transient("fetcher panicked")));
      match attempt_result {
        Ok(data) => break Ok(data),
        Err(e) if e.is_retryable() && attempt < retry.count => {
          let delay = retry.delay_for(attempt);
          attempt += 1;
          debug!(key = %key, attempt, ?delay, "Fetch failed, retrying: {}", e);
          tokio::time::sleep(delay).await;
        }
        Err(e) => break Err(e),
      }
    };

    self.settle(&key, &result, &options, prior, generation);

    if let (Ok(data), Some(kind)) = (&result, &options.prefetch_kind) {
      self.inner.prefetch.prefetch_related(self, kind, data);
    }
    result
  }

  /// Drop the in-flight record and write the outcome to the store in one critical section.
  fn settle(
    &self,
    key: &QueryKey,
    result: &Result<Value>,
    options: &QueryOptions,
    prior: EntryStatus,
    generation: u64,
  ) {
    let meta = self.meta_for(key, options);
    let persisted = {
      let mut inflight = lock(&self.inner.inflight);
      if inflight.get(key).map(|r| r.generation) == Some(generation) {
        inflight.remove(key);
      }

      let mut store = lock(&self.inner.store);
      match result {
        Ok(data) => store.set(key, data.clone(), meta).fetched_at,
        Err(QueryError::Aborted) => {
          store.restore_status(key, prior);
          None
        }
        Err(e) => {
          warn!(key = %key, "Query failed: {}", e);
          store.set_error(key, e.clone(), meta);
          None
        }
      }
    };

    if let (Ok(data), Some(fetched_at), Some(persistence)) =
      (result, persisted, self.inner.persistence.as_ref())
    {
      persistence.persist(key, data, fetched_at);
    }
    self.notify(key);
  }

  /// Re-run the last fetcher used for `key` without waiting for it.
  ///
  /// Returns `false` when the key has never been fetched through the executor.
  pub fn refetch_key(&self, key: &QueryKey) -> bool {
    if self.inner.scheduler.is_disposed() {
      return false;
    }
    let refetch = lock(&self.inner.store)
      .get(key)
      .and_then(|e| e.refetch.clone());
    match refetch {
      Some(Refetch { fetcher, options }) => {
        drop(self.start(key, fetcher, &options));
        true
      }
      None => false,
    }
  }

  /// Whether `key` holds fresh, successful data.
  pub fn is_fresh(&self, key: &QueryKey) -> bool {
    let store = lock(&self.inner.store);
    let now = store.now();
    store
      .get(key)
      .map_or(false, |e| e.status == EntryStatus::Success && !e.is_stale(now))
  }

  /// Mark matching entries stale, returning keys and whether each has subscribers.
  pub fn mark_stale(&self, pattern: &KeyPattern) -> Vec<(QueryKey, bool)> {
    let marked = lock(&self.inner.store).mark_stale(pattern);
    for (key, _) in &marked {
      self.notify(key);
    }
    marked
  }

  /// Hard-remove entries (all of them for `None`) and their persisted mirrors.
  pub fn clear(&self, pattern: Option<&KeyPattern>) -> Vec<QueryKey> {
    let removed = {
      let mut store = lock(&self.inner.store);
      match pattern {
        Some(p) => store.remove_matching(p),
        None => store.clear(),
      }
    };

    {
      let mut hydrated = lock(&self.inner.hydrated);
      for key in &removed {
        hydrated.remove(key);
      }
    }

    if let Some(persistence) = self.inner.persistence.as_ref() {
      for key in &removed {
        persistence.remove(key);
      }
      if let Some(KeyPattern::Exact(key)) = pattern {
        if !removed.contains(key) {
          persistence.remove(key);
        }
      }
    }

    for key in &removed {
      self.notify(key);
    }
    removed
  }

  /// Write `data` directly, as if it had just been fetched.
  pub fn set_entry(&self, key: &QueryKey, data: Value) {
    let meta = self.meta_for(key, &QueryOptions::default());
    let fetched_at = lock(&self.inner.store).set(key, data.clone(), meta).fetched_at;
    if let (Some(persistence), Some(fetched_at)) = (self.inner.persistence.as_ref(), fetched_at) {
      persistence.persist(key, &data, fetched_at);
    }
    self.notify(key);
  }

  pub fn get_entry(&self, key: &QueryKey) -> Option<CacheEntry> {
    lock(&self.inner.store).get(key).cloned()
  }

  pub(crate) fn subscribe(&self, key: &QueryKey) {
    lock(&self.inner.store).subscribe(key);
  }

  pub(crate) fn unsubscribe(&self, key: &QueryKey) {
    lock(&self.inner.store).unsubscribe(key);
  }

  pub fn sweep(&self) -> Vec<QueryKey> {
    lock(&self.inner.store).sweep()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher, CacheSource, StrategyProfile};
  use crate::clock::{ManualClock, SystemClock};
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  fn executor(clock: &ManualClock) -> QueryExecutor {
    QueryExecutor::new(ExecutorParts {
      store: CacheStore::new(Arc::new(clock.clone())),
      scheduler: Scheduler::new(),
      profiles: ProfileTable::new(StrategyProfile::new(
        Duration::from_secs(1),
        Duration::from_secs(10),
      )),
      default_retry: RetryPolicy::none(),
      persistence: None,
      prefetch: Arc::new(PrefetchOrchestrator::new()),
    })
  }

  fn counting(calls: Arc<AtomicUsize>, value: Value) -> Fetcher {
    fetcher(move |_key| {
      let calls = calls.clone();
      let value = value.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(value)
      }
    })
  }

  #[test]
  fn test_exponential_backoff_is_capped() {
    let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500));
    assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    assert_eq!(policy.delay_for(40), Duration::from_millis(500));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_fetch() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let f = counting(calls.clone(), json!({"id": 42}));
    let key = QueryKey::parse("user:42");
    let options = QueryOptions::default();

    let (a, b) = tokio::join!(
      exec.fetch(&key, f.clone(), &options),
      exec.fetch(&key, f.clone(), &options)
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap().data, json!({"id": 42}));
    assert_eq!(b.unwrap().data, json!({"id": 42}));
    assert_eq!(exec.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_waiters_share_failure() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let f = fetcher(move |_| {
      let c = c.clone();
      async move {
        c.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<Value, _>(QueryError::transient("boom"))
      }
    });
    let key = QueryKey::parse("user:1");
    let options = QueryOptions::default();

    let (a, b, c) = tokio::join!(
      exec.execute(&key, f.clone(), &options),
      exec.execute(&key, f.clone(), &options),
      exec.execute(&key, f.clone(), &options)
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), QueryError::transient("boom"));
    assert_eq!(b.unwrap_err(), QueryError::transient("boom"));
    assert_eq!(c.unwrap_err(), QueryError::transient("boom"));
    assert_eq!(exec.get_entry(&key).unwrap().status, EntryStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_fetcher_settles_as_failure() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let f = fetcher(move |_| {
      let c = c.clone();
      async move {
        if c.fetch_add(1, Ordering::SeqCst) == 0 {
          panic!("collaborator bug");
        }
        Ok(json!("recovered"))
      }
    });
    let key = QueryKey::parse("user:1");
    let options = QueryOptions::default();

    let err = exec.execute(&key, f.clone(), &options).await.unwrap_err();
    assert_eq!(err, QueryError::transient("fetcher panicked"));
    assert_eq!(exec.in_flight(), 0);
    assert_eq!(exec.get_entry(&key).unwrap().status, EntryStatus::Error);

    let result = exec.fetch(&key, f, &options).await.unwrap();
    assert_eq!(result.data, json!("recovered"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_zero_gc_time_fetch_succeeds_with_system_clock() {
    let exec = QueryExecutor::new(ExecutorParts {
      store: CacheStore::new(Arc::new(SystemClock)),
      scheduler: Scheduler::new(),
      profiles: ProfileTable::new(StrategyProfile::new(Duration::ZERO, Duration::ZERO)),
      default_retry: RetryPolicy::none(),
      persistence: None,
      prefetch: Arc::new(PrefetchOrchestrator::new()),
    });
    let f = fetcher(|_| async { Ok(json!(1)) });
    let options = QueryOptions::default();

    for i in 0..50 {
      let key = QueryKey::root("ticker").with(i % 3);
      let result = exec.fetch(&key, f.clone(), &options).await.unwrap();
      assert_eq!(result.data, json!(1));
      exec.set_entry(&key, json!(2));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_without_dedupe_each_caller_fetches() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let f = counting(calls.clone(), json!(1));
    let key = QueryKey::parse("user:1");
    let options = QueryOptions::default().with_dedupe(false);

    let _ = tokio::join!(
      exec.execute(&key, f.clone(), &options),
      exec.execute(&key, f.clone(), &options)
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_makes_n_plus_one_attempts() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let f = fetcher(move |_| {
      let c = c.clone();
      async move {
        c.fetch_add(1, Ordering::SeqCst);
        Err::<Value, _>(QueryError::transient("down"))
      }
    });
    let options =
      QueryOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    let result = exec.execute(&QueryKey::parse("x"), f, &options).await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_millis(300));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_recovers() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let f = fetcher(move |_| {
      let c = c.clone();
      async move {
        if c.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(QueryError::transient("flaky"))
        } else {
          Ok(json!("ok"))
        }
      }
    });
    let options =
      QueryOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)));

    let result = exec.execute(&QueryKey::parse("x"), f, &options).await;

    assert_eq!(result.unwrap(), json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_abort_is_not_retried_and_keeps_prior_status() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let key = QueryKey::parse("user:1");
    exec.set_entry(&key, json!("cached"));

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let f = fetcher(move |_| {
      let c = c.clone();
      async move {
        c.fetch_add(1, Ordering::SeqCst);
        Err::<Value, _>(QueryError::Aborted)
      }
    });
    let options =
      QueryOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)));

    let result = exec.execute(&key, f, &options).await;

    assert_eq!(result.unwrap_err(), QueryError::Aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let entry = exec.get_entry(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Success);
    assert_eq!(entry.data, Some(json!("cached")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_read_returns_cached_and_refetches_once() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let key = QueryKey::parse("user:42");
    let calls = Arc::new(AtomicUsize::new(0));
    let f = counting(calls.clone(), json!("v2"));
    let options = QueryOptions::default().with_stale_time(Duration::from_millis(1000));

    exec.set_entry(&key, json!("v1"));
    clock.advance(chrono::Duration::milliseconds(1500));

    let first = exec.fetch(&key, f.clone(), &options).await.unwrap();
    assert_eq!(first.data, json!("v1"));
    assert_eq!(first.source, CacheSource::CacheStale);

    // A second stale read while revalidating joins the same fetch.
    let second = exec.fetch(&key, f.clone(), &options).await.unwrap();
    assert_eq!(second.data, json!("v1"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(exec.get_entry(&key).unwrap().data, Some(json!("v2")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_read_skips_fetch() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let key = QueryKey::parse("user:42");
    let calls = Arc::new(AtomicUsize::new(0));
    let f = counting(calls.clone(), json!(1));
    let options = QueryOptions::default();

    exec.fetch(&key, f.clone(), &options).await.unwrap();
    let hit = exec.fetch(&key, f.clone(), &options).await.unwrap();

    assert_eq!(hit.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = exec.read_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_read_without_background_refetch_waits() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let key = QueryKey::parse("user:42");
    let calls = Arc::new(AtomicUsize::new(0));
    let f = counting(calls.clone(), json!("v2"));
    let options = QueryOptions::default().with_background_refetch(false);

    exec.set_entry(&key, json!("v1"));
    clock.advance(chrono::Duration::seconds(2));

    let result = exec.fetch(&key, f, &options).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, json!("v2"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_forces_next_read_to_fetch() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let key = QueryKey::parse("user:42");
    let calls = Arc::new(AtomicUsize::new(0));
    let f = counting(calls.clone(), json!(1));
    let options = QueryOptions::default();

    exec.fetch(&key, f.clone(), &options).await.unwrap();
    exec.clear(Some(&KeyPattern::exact(key.clone())));
    let result = exec.fetch(&key, f, &options).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entries_keep_stale_before_expiry() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    let key = QueryKey::parse("k");
    let options = QueryOptions::default()
      .with_stale_time(Duration::from_secs(60))
      .with_gc_time(Duration::from_secs(5));

    exec
      .execute(&key, fetcher(|_| async { Ok(json!(1)) }), &options)
      .await
      .unwrap();

    let entry = exec.get_entry(&key).unwrap();
    assert!(entry.stale_at <= entry.expires_at);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disposed_executor_refuses_work() {
    let clock = ManualClock::default();
    let exec = executor(&clock);
    exec.scheduler().dispose();

    let result = exec
      .execute(&QueryKey::parse("k"), fetcher(|_| async { Ok(json!(1)) }), &QueryOptions::default())
      .await;

    assert_eq!(result.unwrap_err(), QueryError::Disposed);
  }
}
