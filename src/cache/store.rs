//! In-memory cache store: canonical key → cache entry, with eviction sweep.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::{KeyPattern, QueryKey};
use super::traits::Fetcher;
use crate::clock::{after, Clock};
use crate::error::QueryError;
use crate::executor::QueryOptions;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Idle,
  Loading,
  Success,
  Error,
}

/// Freshness windows applied when an entry is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
  pub stale_time: Duration,
  pub gc_time: Duration,
}

impl EntryMeta {
  pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
    Self {
      stale_time: stale_time.min(gc_time),
      gc_time,
    }
  }
}

/// How an entry can be fetched again without a caller present.
#[derive(Clone)]
pub(crate) struct Refetch {
  pub fetcher: Fetcher,
  pub options: QueryOptions,
}

/// A single cached query result and its bookkeeping.
#[derive(Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub data: Option<Value>,
  pub status: EntryStatus,
  pub fetched_at: Option<DateTime<Utc>>,
  pub stale_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub error: Option<QueryError>,
  pub subscriber_count: usize,
  /// Marked stale by invalidation; cleared by the next successful write.
  pub invalidated: bool,
  pub(crate) refetch: Option<Refetch>,
}

impl CacheEntry {
  fn new(key: QueryKey, now: DateTime<Utc>) -> Self {
    Self {
      key,
      data: None,
      status: EntryStatus::Idle,
      fetched_at: None,
      stale_at: now,
      expires_at: now,
      error: None,
      subscriber_count: 0,
      invalidated: false,
      refetch: None,
    }
  }

  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    self.invalidated || now > self.stale_at
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }

  pub fn has_subscribers(&self) -> bool {
    self.subscriber_count > 0
  }

  fn stamp(&mut self, now: DateTime<Utc>, meta: EntryMeta) {
    let meta = EntryMeta::new(meta.stale_time, meta.gc_time);
    self.fetched_at = Some(now);
    self.stale_at = after(now, meta.stale_time);
    self.expires_at = after(now, meta.gc_time);
  }
}

impl fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key)
      .field("status", &self.status)
      .field("fetched_at", &self.fetched_at)
      .field("stale_at", &self.stale_at)
      .field("expires_at", &self.expires_at)
      .field("error", &self.error)
      .field("subscriber_count", &self.subscriber_count)
      .field("invalidated", &self.invalidated)
      .finish_non_exhaustive()
  }
}

/// In-memory map of query key to cache entry.
///
/// Every write starts with a sweep, so expired unsubscribed entries never outlive
/// the next mutation. The entry being written is stamped after that sweep and
/// survives until the following one, even with a zero `gc_time`.
pub struct CacheStore {
  entries: HashMap<QueryKey, CacheEntry>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: HashMap::new(),
      clock,
    }
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
    self.entries.values()
  }

  fn entry_mut(&mut self, key: &QueryKey) -> &mut CacheEntry {
    let now = self.clock.now();
    self
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone(), now))
  }

  /// Write a successful value, creating the entry if needed.
  pub fn set(&mut self, key: &QueryKey, data: Value, meta: EntryMeta) -> &CacheEntry {
    self.set_at(key, data, meta, self.clock.now())
  }

  /// Write a successful value fetched at `fetched_at` (used for rehydration).
  pub(crate) fn set_at(
    &mut self,
    key: &QueryKey,
    data: Value,
    meta: EntryMeta,
    fetched_at: DateTime<Utc>,
  ) -> &CacheEntry {
    self.sweep();
    let entry = self.entry_mut(key);
    entry.data = Some(data);
    entry.status = EntryStatus::Success;
    entry.error = None;
    entry.invalidated = false;
    entry.stamp(fetched_at, meta);
    entry
  }

  /// Record the start of a fetch, returning the status to restore if it is aborted.
  pub(crate) fn begin_fetch(&mut self, key: &QueryKey) -> EntryStatus {
    let entry = self.entry_mut(key);
    let prior = entry.status;
    entry.status = EntryStatus::Loading;
    prior
  }

  /// Record a failed fetch. Previously fetched data is kept.
  pub(crate) fn set_error(&mut self, key: &QueryKey, error: QueryError, meta: EntryMeta) {
    let now = self.clock.now();
    self.sweep_at(now);
    let entry = self.entry_mut(key);
    entry.status = EntryStatus::Error;
    entry.error = Some(error);
    entry.stamp(now, meta);
  }

  /// Put an entry back into the state it had before an aborted fetch.
  pub(crate) fn restore_status(&mut self, key: &QueryKey, status: EntryStatus) {
    if let Some(entry) = self.entries.get_mut(key) {
      entry.status = status;
    }
  }

  pub(crate) fn set_refetch(&mut self, key: &QueryKey, refetch: Refetch) {
    self.entry_mut(key).refetch = Some(refetch);
  }

  pub fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry> {
    self.entries.remove(key)
  }

  /// Remove every entry matching `pattern`, returning the removed keys.
  pub fn remove_matching(&mut self, pattern: &KeyPattern) -> Vec<QueryKey> {
    let keys = self.keys_matching(pattern);
    for key in &keys {
      self.entries.remove(key);
    }
    keys
  }

  pub fn clear(&mut self) -> Vec<QueryKey> {
    self.entries.drain().map(|(key, _)| key).collect()
  }

  pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
    self
      .entries
      .keys()
      .filter(|key| pattern.matches(key))
      .cloned()
      .collect()
  }

  /// Mark matching entries stale without dropping their data.
  ///
  /// Returns the affected keys together with whether each has subscribers.
  pub fn mark_stale(&mut self, pattern: &KeyPattern) -> Vec<(QueryKey, bool)> {
    let now = self.clock.now();
    self
      .entries
      .values_mut()
      .filter(|entry| pattern.matches(&entry.key))
      .map(|entry| {
        entry.invalidated = true;
        if entry.stale_at > now {
          entry.stale_at = now;
        }
        (entry.key.clone(), entry.has_subscribers())
      })
      .collect()
  }

  pub(crate) fn subscribe(&mut self, key: &QueryKey) -> usize {
    let entry = self.entry_mut(key);
    entry.subscriber_count += 1;
    entry.subscriber_count
  }

  pub(crate) fn unsubscribe(&mut self, key: &QueryKey) -> usize {
    match self.entries.get_mut(key) {
      Some(entry) => {
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        entry.subscriber_count
      }
      None => 0,
    }
  }

  /// Evict expired entries that nobody is subscribed to. Loading entries are kept.
  pub fn sweep(&mut self) -> Vec<QueryKey> {
    let now = self.clock.now();
    self.sweep_at(now)
  }

  fn sweep_at(&mut self, now: DateTime<Utc>) -> Vec<QueryKey> {
    let evicted: Vec<QueryKey> = self
      .entries
      .values()
      .filter(|entry| {
        entry.is_expired(now) && !entry.has_subscribers() && entry.status != EntryStatus::Loading
      })
      .map(|entry| entry.key.clone())
      .collect();

    for key in &evicted {
      self.entries.remove(key);
    }
    if !evicted.is_empty() {
      tracing::debug!("Swept {} expired cache entries", evicted.len());
    }
    evicted
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{ManualClock, SystemClock};
  use serde_json::json;

  fn store() -> (CacheStore, ManualClock) {
    let clock = ManualClock::default();
    (CacheStore::new(Arc::new(clock.clone())), clock)
  }

  fn meta(stale_ms: u64, gc_ms: u64) -> EntryMeta {
    EntryMeta::new(Duration::from_millis(stale_ms), Duration::from_millis(gc_ms))
  }

  #[test]
  fn test_set_and_get() {
    let (mut store, _) = store();
    let key = QueryKey::parse("user:42");

    store.set(&key, json!({"name": "Ada"}), meta(1000, 5000));

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, EntryStatus::Success);
    assert_eq!(entry.data, Some(json!({"name": "Ada"})));
    assert!(entry.stale_at <= entry.expires_at);
  }

  #[test]
  fn test_stale_time_is_clamped_to_gc_time() {
    let (mut store, _) = store();
    let key = QueryKey::parse("user:1");

    let entry = store.set(&key, json!(1), EntryMeta {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::from_secs(1),
    });

    assert_eq!(entry.stale_at, entry.expires_at);
  }

  #[test]
  fn test_staleness_follows_clock() {
    let (mut store, clock) = store();
    let key = QueryKey::parse("user:42");
    store.set(&key, json!(1), meta(1000, 5000));

    clock.advance(chrono::Duration::milliseconds(1500));

    let entry = store.get(&key).unwrap();
    assert!(entry.is_stale(store.now()));
    assert!(!entry.is_expired(store.now()));
  }

  #[test]
  fn test_sweep_keeps_subscribed_entries() {
    let (mut store, clock) = store();
    let watched = QueryKey::parse("user:1");
    let unwatched = QueryKey::parse("user:2");
    store.set(&watched, json!(1), meta(10, 100));
    store.set(&unwatched, json!(2), meta(10, 100));
    store.subscribe(&watched);

    clock.advance(chrono::Duration::milliseconds(200));
    let evicted = store.sweep();

    assert_eq!(evicted, vec![unwatched.clone()]);
    assert!(store.get(&watched).is_some());
    assert!(store.get(&unwatched).is_none());
  }

  #[test]
  fn test_set_sweeps_expired_entries() {
    let (mut store, clock) = store();
    store.set(&QueryKey::parse("old"), json!(1), meta(10, 100));
    clock.advance(chrono::Duration::milliseconds(200));

    store.set(&QueryKey::parse("new"), json!(2), meta(10, 100));

    assert!(store.get(&QueryKey::parse("old")).is_none());
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_zero_gc_time_write_survives_its_own_sweep() {
    let mut store = CacheStore::new(Arc::new(SystemClock));
    let key = QueryKey::parse("ticker:eur");

    for i in 0..200 {
      let entry = store.set(&key, json!(i), meta(0, 0));
      assert_eq!(entry.data, Some(json!(i)));
    }
    assert_eq!(store.get(&key).unwrap().data, Some(json!(199)));

    store.set_error(&key, QueryError::transient("down"), meta(0, 0));
    assert_eq!(store.get(&key).unwrap().status, EntryStatus::Error);
  }

  #[test]
  fn test_remove_matching_prefix() {
    let (mut store, _) = store();
    store.set(&QueryKey::parse("user:1"), json!(1), meta(10, 100));
    store.set(&QueryKey::parse("user:2:posts"), json!(2), meta(10, 100));
    store.set(&QueryKey::parse("project:1"), json!(3), meta(10, 100));

    let mut removed = store.remove_matching(&KeyPattern::prefix("user"));
    removed.sort_by(|a, b| a.canonical().cmp(b.canonical()));

    assert_eq!(removed.len(), 2);
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_mark_stale_keeps_data() {
    let (mut store, _) = store();
    let key = QueryKey::parse("user:1");
    store.set(&key, json!(1), meta(10_000, 100_000));
    store.subscribe(&key);

    let marked = store.mark_stale(&KeyPattern::prefix("user"));

    assert_eq!(marked, vec![(key.clone(), true)]);
    let entry = store.get(&key).unwrap();
    assert!(entry.is_stale(store.now()));
    assert_eq!(entry.data, Some(json!(1)));
    assert!(entry.stale_at <= entry.expires_at);
  }

  #[test]
  fn test_aborted_fetch_restores_prior_status() {
    let (mut store, _) = store();
    let key = QueryKey::parse("user:1");
    store.set(&key, json!(1), meta(10, 100));

    let prior = store.begin_fetch(&key);
    assert_eq!(store.get(&key).unwrap().status, EntryStatus::Loading);

    store.restore_status(&key, prior);
    assert_eq!(store.get(&key).unwrap().status, EntryStatus::Success);
  }

  #[test]
  fn test_unsubscribe_never_goes_negative() {
    let (mut store, _) = store();
    let key = QueryKey::parse("user:1");
    store.subscribe(&key);
    assert_eq!(store.unsubscribe(&key), 0);
    assert_eq!(store.unsubscribe(&key), 0);
  }
}
