//! Consumer-facing query handles.
//!
//! Inspired by TanStack Query. Every handle follows the same poll model: the host
//! calls `poll()` from its event-loop tick and re-renders when it returns `true`.
//!
//! ```ignore
//! let mut query: Query<User> = Query::new(&client, "user:42", user_fetcher);
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(user) => render_user(user),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

mod debounced;
mod infinite;
mod lazy;
mod standard;

pub use debounced::DebouncedQuery;
pub use infinite::InfiniteQuery;
pub use lazy::LazyQuery;
pub use standard::Query;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::cache::{decode, CacheEntry, EntryStatus, Payload, QueryKey};
use crate::error::{QueryError, Result};

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is fetching and has nothing to show yet
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(QueryError),
}

impl<T> QueryState<T> {
  pub fn is_idle(&self) -> bool {
    matches!(self, QueryState::Idle)
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&QueryError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

impl<T: Payload> QueryState<T> {
  pub(crate) fn from_result(result: Result<Value>) -> Self {
    match result.and_then(|value| decode(&value)) {
      Ok(data) => QueryState::Success(data),
      Err(e) => QueryState::Error(e),
    }
  }

  /// State to show for a settled entry; `None` while it is loading or idle.
  pub(crate) fn from_entry(entry: &CacheEntry) -> Option<Self> {
    match (entry.status, &entry.data, &entry.error) {
      (EntryStatus::Error, _, Some(e)) => Some(QueryState::Error(e.clone())),
      (EntryStatus::Success, Some(data), _) => Some(Self::from_result(Ok(data.clone()))),
      _ => None,
    }
  }
}

/// Drain pending change notifications, reporting whether `key` was among them.
///
/// A lagged receiver may have missed it, so lag counts as a change.
pub(crate) fn drain_changes(changes: &mut broadcast::Receiver<QueryKey>, key: &QueryKey) -> bool {
  let mut touched = false;
  loop {
    match changes.try_recv() {
      Ok(changed) => touched |= &changed == key,
      Err(TryRecvError::Lagged(_)) => touched = true,
      Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return touched,
    }
  }
}
