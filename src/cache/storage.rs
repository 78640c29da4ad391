//! Durable key-value storage contract and its implementations.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{QueryError, Result};

/// Trait for durable storage backends consumed by the persistence adapter.
pub trait DurableStore: Send + Sync {
  fn get(&self, storage_key: &str) -> Result<Option<String>>;

  fn set(&self, storage_key: &str, value: &str) -> Result<()>;

  fn remove(&self, storage_key: &str) -> Result<()>;
}

/// Process-local store, mostly useful in tests.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
    self
      .values
      .lock()
      .map_err(|e| QueryError::Storage(format!("Lock poisoned: {}", e)))
  }

  pub fn len(&self) -> usize {
    self.lock().map(|v| v.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, storage_key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(storage_key).cloned())
  }

  fn set(&self, storage_key: &str, value: &str) -> Result<()> {
    self
      .lock()?
      .insert(storage_key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, storage_key: &str) -> Result<()> {
    self.lock()?.remove(storage_key);
    Ok(())
  }
}

/// SQLite-based durable storage.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| QueryError::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      QueryError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// An in-memory database, discarded when dropped.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| QueryError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("querykit").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| QueryError::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Number of stored records.
  pub fn count(&self) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  /// Delete every stored record, returning how many were removed.
  pub fn clear_all(&self) -> Result<usize> {
    Ok(self.lock()?.execute("DELETE FROM kv_store", [])?)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(KV_SCHEMA)
      .map_err(|e| QueryError::Storage(format!("Failed to run cache migrations: {}", e)))
  }
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    storage_key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  fn get(&self, storage_key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE storage_key = ?",
        params![storage_key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, storage_key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (storage_key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![storage_key, value],
      )
      .map_err(|e| QueryError::Storage(format!("Failed to store value: {}", e)))?;
    Ok(())
  }

  fn remove(&self, storage_key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM kv_store WHERE storage_key = ?",
      params![storage_key],
    )?;
    Ok(())
  }
}
