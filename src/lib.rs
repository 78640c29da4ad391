//! querykit: a client-side query cache.
//!
//! One [`QueryClient`] owns the cache. Consumers read through it with the handles in
//! [`query`]; mutation code tells it what changed with named invalidation events.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod invalidation;
pub mod prefetch;
pub mod query;
pub mod scheduler;

pub use cache::{
  fetcher, typed_fetcher, CacheResult, CacheSource, Fetcher, KeyPattern, QueryKey, Strategy,
};
pub use client::{CacheStats, ClientBuilder, QueryClient, Subscription};
pub use error::{QueryError, Result};
pub use executor::{QueryOptions, RetryPolicy};
pub use invalidation::{InvalidationReport, InvalidationRule};
pub use prefetch::Relation;
pub use query::{DebouncedQuery, InfiniteQuery, LazyQuery, Query, QueryState};
