//! Cache data structures and persistence.
//!
//! This module holds everything that stores query results:
//! - Canonical query keys and key patterns
//! - The in-memory entry store with its eviction sweep
//! - Strategy profiles that set default freshness per key prefix
//! - The persistence adapter and the durable stores it writes to

mod key;
mod persist;
mod storage;
mod store;
mod strategy;
mod traits;

pub use key::{KeyPart, KeyPattern, QueryKey};
pub use persist::{PersistedRecord, PersistenceAdapter};
pub use storage::{DurableStore, MemoryStore, SqliteStore};
pub use store::{CacheEntry, CacheStore, EntryMeta, EntryStatus};
pub(crate) use store::Refetch;
pub use strategy::{ProfileTable, Strategy, StrategyProfile};
pub use traits::{decode, encode, fetcher, typed_fetcher, CacheResult, CacheSource, Fetcher, Payload};
