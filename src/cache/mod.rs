//! Client-held application cache.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Keeps an in-memory map as the runtime source of truth
//! - Mirrors every mutation to a persistent backing in the background
//! - Deduplicates concurrent fetches of the same key
//! - Expires entries by TTL, both on read and with a periodic sweep
//! - Serves stale entries while revalidating, or when the network is down
//! - Evicts the oldest persisted entry when the backing runs out of space

mod clock;
pub mod codec;
mod coordinator;
mod error;
mod eviction;
mod key;
mod layer;
mod storage;
mod store;
mod sweeper;
mod traits;
mod writer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{FetchState, PendingFetch, RequestCoordinator};
pub use error::{FetchError, StorageError};
pub use eviction::EvictionManager;
pub use key::{CacheKey, CacheKeyBuilder, Selector};
pub use layer::{CacheConfig, CacheService};
pub use storage::{Backing, MemoryBacking, NoopBacking, SqliteBacking};
pub use store::CacheStore;
pub use sweeper::{retain_fresh, Sweeper};
pub use traits::{CacheEntry, CacheResult, CacheSource, CachedValue, Cacheable, ReadOptions};
