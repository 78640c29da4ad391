use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Query, QueryState};
use crate::cache::{Fetcher, Payload, QueryKey};
use crate::client::QueryClient;
use crate::error::QueryError;
use crate::executor::QueryOptions;
use crate::scheduler::VisibilityGuard;

/// A query that waits for its visibility target to be shown.
///
/// Each not-visible to visible transition fires one cache-aware fetch. Hiding the
/// target re-arms it.
pub struct LazyQuery<T> {
  query: Query<T>,
  target: String,
  client: QueryClient,
  signals: mpsc::UnboundedReceiver<bool>,
  armed: bool,
  fired: usize,
  _guard: VisibilityGuard,
}

impl<T: Payload> LazyQuery<T> {
  pub fn new(
    client: &QueryClient,
    target: &str,
    key: impl Into<QueryKey>,
    fetcher: Fetcher,
  ) -> Self {
    let (tx, signals) = mpsc::unbounded_channel();
    let guard = client.visibility().subscribe(
      target,
      Arc::new(move |visible: bool| {
        let _ = tx.send(visible);
      }),
    );

    Self {
      query: Query::new(client, key, fetcher),
      target: target.to_string(),
      client: client.clone(),
      signals,
      armed: true,
      fired: 0,
      _guard: guard,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.query = self.query.with_options(options);
    self
  }

  pub fn query(&self) -> &Query<T> {
    &self.query
  }

  pub fn state(&self) -> &QueryState<T> {
    self.query.state()
  }

  pub fn data(&self) -> Option<&T> {
    self.query.data()
  }

  pub fn is_loading(&self) -> bool {
    self.query.is_loading()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.query.error()
  }

  pub fn is_visible(&self) -> bool {
    self.client.visibility().is_visible(&self.target)
  }

  /// Fetches started by visibility transitions so far. A transition that finds a
  /// fetch already pending is served by that fetch and not counted.
  pub fn fired(&self) -> usize {
    self.fired
  }

  /// Fetch again now, regardless of visibility.
  pub fn retrigger(&mut self) {
    self.query.refetch();
  }

  /// Handle visibility transitions, then poll the underlying query.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok(visible) = self.signals.try_recv() {
      if !visible {
        self.armed = true;
      } else if self.armed {
        self.armed = false;
        if self.query.fetch() {
          self.fired += 1;
          changed = true;
        }
      }
    }
    self.query.poll() || changed
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LazyQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LazyQuery")
      .field("target", &self.target)
      .field("query", &self.query)
      .field("fired", &self.fired)
      .finish_non_exhaustive()
  }
}
