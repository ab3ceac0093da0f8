//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Payloads that can be held by the cache.
///
/// The cache never looks inside a payload; it only needs to clone it for
/// joined callers and to serialize it for the persistent backing.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  /// Creation instant in milliseconds since the Unix epoch
  pub timestamp: i64,
  /// Lifetime in milliseconds; `None` never expires by age
  pub ttl: Option<u64>,
}

impl<T> CacheEntry<T> {
  pub fn new(key: impl Into<String>, data: T, timestamp: i64, ttl: Option<Duration>) -> Self {
    Self {
      key: key.into(),
      data,
      timestamp,
      ttl: ttl.map(duration_to_ms),
    }
  }

  /// Milliseconds elapsed since creation, clamped at zero.
  pub fn age_ms(&self, now_ms: i64) -> u64 {
    u64::try_from(now_ms.saturating_sub(self.timestamp)).unwrap_or(0)
  }

  pub fn is_expired(&self, now_ms: i64) -> bool {
    match self.ttl {
      Some(ttl) => self.age_ms(now_ms) > ttl,
      None => false,
    }
  }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Options for [`CacheService::get_cached`](super::CacheService::get_cached).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
  /// Return expired entries instead of treating them as absent
  pub skip_expiry: bool,
}

impl ReadOptions {
  pub fn skip_expiry() -> Self {
    Self { skip_expiry: true }
  }
}

/// A value read from the in-memory store.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
  pub data: T,
  pub is_expired: bool,
  pub age: Duration,
}

impl<T: Clone> CachedValue<T> {
  pub(crate) fn from_entry(entry: &CacheEntry<T>, now_ms: i64) -> Self {
    Self {
      data: entry.data.clone(),
      is_expired: entry.is_expired(now_ms),
      age: Duration::from_millis(entry.age_ms(now_ms)),
    }
  }
}

impl<T> CachedValue<T> {
  /// Age in whole milliseconds, saturating at `u64::MAX`.
  pub fn age_ms(&self) -> u64 {
    duration_to_ms(self.age)
  }
}

/// Result from a read-through operation, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Age of the cached entry (if from cache)
  pub age: Option<Duration>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from freshly fetched data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      age: None,
    }
  }

  /// Create a new cache result from a cached value.
  pub fn from_cache(cached: CachedValue<T>) -> Self {
    Self {
      source: if cached.is_expired {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      age: Some(cached.age),
      data: cached.data,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(cached: CachedValue<T>) -> Self {
    Self {
      data: cached.data,
      source: CacheSource::Offline,
      age: Some(cached.age),
    }
  }

  pub fn is_expired(&self) -> bool {
    matches!(self.source, CacheSource::CacheStale | CacheSource::Offline)
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the fetcher
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, expired, with a background refresh in progress
  CacheStale,
  /// Fetcher failed, serving expired cached data
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_without_ttl_never_expires() {
    let entry = CacheEntry::new("k", 1, 10, None);
    assert!(!entry.is_expired(i64::MAX));
  }

  #[test]
  fn test_entry_expires_strictly_after_ttl() {
    let entry = CacheEntry::new("k", 1, 1_000, Some(Duration::from_millis(500)));
    assert!(!entry.is_expired(1_500));
    assert!(entry.is_expired(1_501));
  }

  #[test]
  fn test_age_clamps_when_clock_goes_backwards() {
    let entry = CacheEntry::new("k", 1, 2_000, None);
    assert_eq!(entry.age_ms(1_000), 0);
  }

  #[test]
  fn test_cached_value_age_ms_saturates() {
    let value = CachedValue {
      data: (),
      is_expired: false,
      age: Duration::from_millis(1_234),
    };
    assert_eq!(value.age_ms(), 1_234);

    let ancient = CachedValue {
      data: (),
      is_expired: true,
      age: Duration::MAX,
    };
    assert_eq!(ancient.age_ms(), u64::MAX);
  }

  #[test]
  fn test_cache_result_source_from_expiry() {
    let stale = CachedValue {
      data: "v",
      is_expired: true,
      age: Duration::from_secs(2),
    };
    let result = CacheResult::from_cache(stale);
    assert_eq!(result.source, CacheSource::CacheStale);
    assert!(result.is_expired());
    assert_eq!(result.age, Some(Duration::from_secs(2)));
  }
}
