//! Timers, tracked tasks and visibility signals.
//!
//! Every deferred callback in the engine (retry delays, delayed invalidation,
//! debounce windows, refetch intervals) goes through a [`Scheduler`]. Timers are
//! returned as [`TimerHandle`]s that cancel on drop, and `dispose` aborts anything
//! still outstanding so nothing fires against torn-down state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

#[derive(Default)]
struct SchedulerInner {
  next_id: u64,
  tasks: HashMap<u64, AbortHandle>,
  disposed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owner of every timer and background task the engine starts.
#[derive(Clone, Default)]
pub struct Scheduler {
  inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Spawn a tracked task. It is aborted if the scheduler is disposed first.
  pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.spawn_tracked(fut).1
  }

  fn spawn_tracked<F>(&self, fut: F) -> (u64, JoinHandle<F::Output>)
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    let mut inner = lock(&self.inner);
    let id = inner.next_id;
    inner.next_id += 1;

    let weak = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      let out = fut.await;
      if let Some(inner) = weak.upgrade() {
        lock(&inner).tasks.remove(&id);
      }
      out
    });

    if inner.disposed {
      handle.abort();
    } else {
      inner.tasks.insert(id, handle.abort_handle());
    }
    (id, handle)
  }

  /// Run `f` once after `delay`.
  pub fn after<F>(&self, delay: Duration, f: F) -> TimerHandle
  where
    F: FnOnce() + Send + 'static,
  {
    let (id, handle) = self.spawn_tracked(async move {
      tokio::time::sleep(delay).await;
      f();
    });
    TimerHandle::new(id, handle.abort_handle(), &self.inner)
  }

  /// Run `f` every `period`, first after one full period.
  pub fn every<F>(&self, period: Duration, mut f: F) -> TimerHandle
  where
    F: FnMut() + Send + 'static,
  {
    let (id, handle) = self.spawn_tracked(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        f();
      }
    });
    TimerHandle::new(id, handle.abort_handle(), &self.inner)
  }

  /// Number of tasks and timers still outstanding.
  pub fn active(&self) -> usize {
    lock(&self.inner).tasks.len()
  }

  pub fn is_disposed(&self) -> bool {
    lock(&self.inner).disposed
  }

  /// Abort everything and refuse new work.
  pub fn dispose(&self) {
    let mut inner = lock(&self.inner);
    inner.disposed = true;
    for (_, task) in inner.tasks.drain() {
      task.abort();
    }
  }
}

/// A scheduled callback. Dropping the handle cancels it.
pub struct TimerHandle {
  id: u64,
  abort: AbortHandle,
  scheduler: Weak<Mutex<SchedulerInner>>,
}

impl TimerHandle {
  fn new(id: u64, abort: AbortHandle, scheduler: &Arc<Mutex<SchedulerInner>>) -> Self {
    Self {
      id,
      abort,
      scheduler: Arc::downgrade(scheduler),
    }
  }

  /// Whether the callback already ran (or was cancelled).
  pub fn is_finished(&self) -> bool {
    self.abort.is_finished()
  }

  pub fn cancel(self) {
    drop(self);
  }
}

impl Drop for TimerHandle {
  fn drop(&mut self) {
    self.abort.abort();
    if let Some(inner) = self.scheduler.upgrade() {
      lock(&inner).tasks.remove(&self.id);
    }
  }
}

impl std::fmt::Debug for TimerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TimerHandle")
      .field("finished", &self.is_finished())
      .finish()
  }
}

pub type VisibilityCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct HubInner {
  next_id: u64,
  subscribers: HashMap<String, Vec<(u64, VisibilityCallback)>>,
  visible: HashMap<String, bool>,
}

/// Observer for visibility of named targets (list rows, panels, ...).
///
/// The host reports transitions with [`VisibilityHub::set_visible`]; subscribers are
/// called on every change and once on subscribe if the target is already visible.
#[derive(Clone, Default)]
pub struct VisibilityHub {
  inner: Arc<Mutex<HubInner>>,
}

impl VisibilityHub {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, target: &str, callback: VisibilityCallback) -> VisibilityGuard {
    let (id, visible) = {
      let mut inner = lock(&self.inner);
      let id = inner.next_id;
      inner.next_id += 1;
      inner
        .subscribers
        .entry(target.to_string())
        .or_default()
        .push((id, callback.clone()));
      (id, inner.visible.get(target).copied().unwrap_or(false))
    };

    if visible {
      callback(true);
    }

    VisibilityGuard {
      id,
      target: target.to_string(),
      hub: Arc::downgrade(&self.inner),
    }
  }

  pub fn set_visible(&self, target: &str, visible: bool) {
    let callbacks: Vec<VisibilityCallback> = {
      let mut inner = lock(&self.inner);
      let previous = inner.visible.insert(target.to_string(), visible);
      if previous == Some(visible) || (previous.is_none() && !visible) {
        return;
      }
      inner
        .subscribers
        .get(target)
        .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
        .unwrap_or_default()
    };

    for callback in callbacks {
      callback(visible);
    }
  }

  pub fn is_visible(&self, target: &str) -> bool {
    lock(&self.inner).visible.get(target).copied().unwrap_or(false)
  }

  pub fn subscriber_count(&self, target: &str) -> usize {
    lock(&self.inner)
      .subscribers
      .get(target)
      .map(Vec::len)
      .unwrap_or(0)
  }
}

/// Unsubscribes from the hub when dropped.
pub struct VisibilityGuard {
  id: u64,
  target: String,
  hub: Weak<Mutex<HubInner>>,
}

impl Drop for VisibilityGuard {
  fn drop(&mut self) {
    if let Some(hub) = self.hub.upgrade() {
      let mut inner = lock(&hub);
      if let Some(subs) = inner.subscribers.get_mut(&self.target) {
        subs.retain(|(id, _)| *id != self.id);
        if subs.is_empty() {
          inner.subscribers.remove(&self.target);
        }
      }
    }
  }
}
