//! Mirrors selected cache entries into a durable store and rehydrates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::key::{KeyPattern, QueryKey};
use super::storage::DurableStore;
use crate::error::QueryError;

/// Serialized form of a persisted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
}

enum WriteOp {
  Set(String, String),
  Remove(String),
  Flush(oneshot::Sender<()>),
}

/// Bridges cache entries to a [`DurableStore`].
///
/// Writes go through a queue drained by a background task, so a cache read never
/// waits on the durable store. Must be constructed inside a tokio runtime.
pub struct PersistenceAdapter {
  store: Arc<dyn DurableStore>,
  patterns: Vec<KeyPattern>,
  writer: mpsc::UnboundedSender<WriteOp>,
}

impl PersistenceAdapter {
  pub fn new(store: Arc<dyn DurableStore>, patterns: Vec<KeyPattern>) -> Self {
    let (writer, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(store.clone(), rx));
    Self {
      store,
      patterns,
      writer,
    }
  }

  pub fn is_persistent(&self, key: &QueryKey) -> bool {
    self.patterns.iter().any(|p| p.matches(key))
  }

  /// Storage key for a query key: a fixed-length hash of its canonical form.
  pub fn storage_key(key: &QueryKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.canonical().as_bytes());
    format!("querykit:{}", hex::encode(hasher.finalize()))
  }

  /// Queue a write of `data` for a persistent key. Non-persistent keys are ignored.
  pub fn persist(&self, key: &QueryKey, data: &Value, fetched_at: DateTime<Utc>) {
    if !self.is_persistent(key) {
      return;
    }
    let record = PersistedRecord {
      data: data.clone(),
      fetched_at,
    };
    match serde_json::to_string(&record) {
      Ok(json) => {
        let _ = self.writer.send(WriteOp::Set(Self::storage_key(key), json));
      }
      Err(e) => {
        let err = QueryError::Validation(e.to_string());
        warn!(key = %key, "Failed to serialize cache entry: {}", err);
      }
    }
  }

  /// Read a persisted record that is still younger than `gc_time`.
  ///
  /// Missing, expired, unreadable and corrupt records all come back as `None`.
  pub fn load(
    &self,
    key: &QueryKey,
    gc_time: Duration,
    now: DateTime<Utc>,
  ) -> Option<PersistedRecord> {
    if !self.is_persistent(key) {
      return None;
    }
    let storage_key = Self::storage_key(key);

    let raw = match self.store.get(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %key, "Failed to read persisted entry: {}", e);
        return None;
      }
    };

    let record: PersistedRecord = match serde_json::from_str(&raw) {
      Ok(record) => record,
      Err(e) => {
        let err = QueryError::Validation(e.to_string());
        warn!(key = %key, "Discarding unreadable persisted entry: {}", err);
        let _ = self.writer.send(WriteOp::Remove(storage_key));
        return None;
      }
    };

    let age = (now - record.fetched_at).to_std().unwrap_or(Duration::ZERO);
    if age >= gc_time {
      debug!(key = %key, ?age, "Persisted entry outlived gc time, discarding");
      let _ = self.writer.send(WriteOp::Remove(storage_key));
      return None;
    }

    Some(record)
  }

  /// Queue removal of the persisted mirror for `key`.
  pub fn remove(&self, key: &QueryKey) {
    if self.is_persistent(key) {
      let _ = self.writer.send(WriteOp::Remove(Self::storage_key(key)));
    }
  }

  /// Wait until every queued write has reached the durable store.
  pub async fn flush(&self) {
    let (tx, rx) = oneshot::channel();
    if self.writer.send(WriteOp::Flush(tx)).is_ok() {
      let _ = rx.await;
    }
  }
}

async fn run_writer(store: Arc<dyn DurableStore>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
  while let Some(op) = rx.recv().await {
    match op {
      WriteOp::Set(storage_key, json) => {
        if let Err(e) = store.set(&storage_key, &json) {
          warn!("Failed to persist cache entry: {}", e);
        }
      }
      WriteOp::Remove(storage_key) => {
        if let Err(e) = store.remove(&storage_key) {
          warn!("Failed to remove persisted cache entry: {}", e);
        }
      }
      WriteOp::Flush(done) => {
        let _ = done.send(());
      }
    }
  }
}
