//! Error taxonomy shared by every engine component.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

/// Errors produced by the query engine.
///
/// The type is `Clone` because one fetch outcome is handed to every caller that
/// joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  /// Retryable fetch failure, surfaced once retries are exhausted.
  #[error("Fetch failed: {0}")]
  Transient(String),

  /// The fetch collaborator signalled cancellation. Never retried, never logged.
  #[error("Fetch aborted")]
  Aborted,

  /// Payload could not be serialized or deserialized.
  #[error("Validation error: {0}")]
  Validation(String),

  /// An invalidation event or prefetch kind that nothing was registered for.
  #[error("Unknown collaborator: {0}")]
  UnknownCollaborator(String),

  /// The durable store failed.
  #[error("Storage error: {0}")]
  Storage(String),

  /// The client was disposed.
  #[error("Query client disposed")]
  Disposed,
}

impl QueryError {
  pub fn transient(msg: impl Into<String>) -> Self {
    QueryError::Transient(msg.into())
  }

  pub fn is_abort(&self) -> bool {
    matches!(self, QueryError::Aborted)
  }

  /// Whether the executor may retry after this error.
  pub fn is_retryable(&self) -> bool {
    matches!(self, QueryError::Transient(_))
  }
}

impl From<serde_json::Error> for QueryError {
  fn from(e: serde_json::Error) -> Self {
    QueryError::Validation(e.to_string())
  }
}

impl From<rusqlite::Error> for QueryError {
  fn from(e: rusqlite::Error) -> Self {
    QueryError::Storage(e.to_string())
  }
}
