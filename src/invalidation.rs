//! Invalidation rules: which cache entries a named mutation event affects.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::KeyPattern;
use crate::error::QueryError;
use crate::executor::QueryExecutor;
use crate::scheduler::TimerHandle;

/// Derives key patterns from a mutation payload.
pub type PayloadPatterns = Arc<dyn Fn(&Value) -> Vec<KeyPattern> + Send + Sync>;

/// What a mutation event invalidates.
#[derive(Clone, Default)]
pub struct InvalidationRule {
  immediate: Vec<KeyPattern>,
  conditional: Option<PayloadPatterns>,
  delayed: Vec<(KeyPattern, Duration)>,
}

impl InvalidationRule {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mark matching entries stale as soon as the event fires.
  pub fn immediate(mut self, pattern: KeyPattern) -> Self {
    self.immediate.push(pattern);
    self
  }

  /// Derive patterns from the event payload (e.g. the id of the mutated entity).
  pub fn conditional<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value) -> Vec<KeyPattern> + Send + Sync + 'static,
  {
    self.conditional = Some(Arc::new(f));
    self
  }

  /// Invalidate matching entries after `delay`.
  pub fn delayed(mut self, pattern: KeyPattern, delay: Duration) -> Self {
    self.delayed.push((pattern, delay));
    self
  }
}

impl std::fmt::Debug for InvalidationRule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InvalidationRule")
      .field("immediate", &self.immediate)
      .field("conditional", &self.conditional.is_some())
      .field("delayed", &self.delayed)
      .finish()
  }
}

/// Outcome of one `invalidate` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationReport {
  /// Entries marked stale right away
  pub marked: usize,
  /// Refetches started for subscribed entries
  pub refetched: usize,
  /// Delayed invalidations scheduled
  pub scheduled: usize,
}

impl std::ops::AddAssign for InvalidationReport {
  fn add_assign(&mut self, other: Self) {
    self.marked += other.marked;
    self.refetched += other.refetched;
    self.scheduled += other.scheduled;
  }
}

/// Pending delayed invalidations, keyed by (event, pattern).
type PendingTimers = Mutex<HashMap<(String, String), TimerHandle>>;

pub struct InvalidationEngine {
  executor: QueryExecutor,
  rules: RwLock<HashMap<String, InvalidationRule>>,
  pending: PendingTimers,
}

impl InvalidationEngine {
  pub fn new(executor: QueryExecutor) -> Self {
    Self {
      executor,
      rules: RwLock::new(HashMap::new()),
      pending: Mutex::new(HashMap::new()),
    }
  }

  pub fn register(&self, event: impl Into<String>, rule: InvalidationRule) {
    self
      .rules
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(event.into(), rule);
  }

  /// Apply the rule bound to `event`.
  ///
  /// Unknown events are logged and ignored. A delayed pattern that is already
  /// pending for this event is not scheduled again, so a burst of mutations
  /// produces a single refresh.
  pub fn invalidate(&self, event: &str, payload: Option<&Value>) -> InvalidationReport {
    let rule = match self
      .rules
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(event)
    {
      Some(rule) => rule.clone(),
      None => {
        warn!("{}", QueryError::UnknownCollaborator(format!("no invalidation rule for '{}'", event)));
        return InvalidationReport::default();
      }
    };

    let mut report = InvalidationReport::default();

    for pattern in &rule.immediate {
      report += invalidate_now(&self.executor, pattern);
    }

    if let (Some(derive), Some(payload)) = (&rule.conditional, payload) {
      for pattern in derive(payload) {
        report += invalidate_now(&self.executor, &pattern);
      }
    }

    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    pending.retain(|_, timer| !timer.is_finished());
    for (pattern, delay) in &rule.delayed {
      let slot = (event.to_string(), pattern.to_string());
      if pending.contains_key(&slot) {
        debug!(event, pattern = %pattern, "Delayed invalidation already pending");
        continue;
      }
      let exec = self.executor.clone();
      let pattern = pattern.clone();
      let timer = self.executor.scheduler().after(*delay, move || {
        invalidate_now(&exec, &pattern);
      });
      pending.insert(slot, timer);
      report.scheduled += 1;
    }

    debug!(event, ?report, "Invalidated");
    report
  }

  /// Hard-remove entries matching `pattern` (everything for `None`).
  pub fn clear(&self, pattern: Option<&KeyPattern>) -> usize {
    self.executor.clear(pattern).len()
  }

  /// Cancel delayed invalidations scheduled by `event`.
  pub fn cancel_pending(&self, event: &str) {
    self
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|(e, _), _| e != event);
  }

  pub fn cancel_all(&self) {
    self
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clear();
  }

  /// Delayed invalidations that have not fired yet.
  pub fn pending(&self) -> usize {
    self
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .filter(|timer| !timer.is_finished())
      .count()
  }
}

/// Mark entries stale and refetch the ones somebody is watching.
fn invalidate_now(executor: &QueryExecutor, pattern: &KeyPattern) -> InvalidationReport {
  let marked = executor.mark_stale(pattern);
  if marked.is_empty() {
    debug!(pattern = %pattern, "Invalidation pattern matched no entries");
  }

  let refetched = marked
    .iter()
    .filter(|(_, subscribed)| *subscribed)
    .filter(|(key, _)| executor.refetch_key(key))
    .count();

  InvalidationReport {
    marked: marked.len(),
    refetched,
    scheduled: 0,
  }
}
