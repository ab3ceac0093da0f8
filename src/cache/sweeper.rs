//! Periodic removal of expired entries.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use super::clock::Clock;
use super::store::CacheStore;
use super::traits::{CacheEntry, Cacheable};

/// The entries of `snapshot` that have not outlived their TTL at `now_ms`.
pub fn retain_fresh<T: Clone>(
  snapshot: &HashMap<String, CacheEntry<T>>,
  now_ms: i64,
) -> HashMap<String, CacheEntry<T>> {
  snapshot
    .iter()
    .filter(|(_, entry)| !entry.is_expired(now_ms))
    .map(|(key, entry)| (key.clone(), entry.clone()))
    .collect()
}

/// Handle to the background sweep task. Dropping it stops the task.
pub struct Sweeper {
  handle: JoinHandle<()>,
}

impl Sweeper {
  /// Sweep `store` every `interval` until the store is dropped.
  pub fn spawn<T: Cacheable>(
    store: Weak<CacheStore<T>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
  ) -> Self {
    let handle = tokio::spawn(async move {
      let mut ticker = time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
          debug!("Cache dropped, stopping sweeper");
          break;
        };
        let removed = store.sweep(clock.now_ms());
        if !removed.is_empty() {
          info!(count = removed.len(), "Swept expired cache entries");
        }
      }
    });

    Self { handle }
  }
}

impl Drop for Sweeper {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::eviction::EvictionManager;
  use crate::cache::storage::MemoryBacking;

  fn entry(key: &str, timestamp: i64, ttl_ms: Option<u64>) -> CacheEntry<u32> {
    CacheEntry::new(key, 7, timestamp, ttl_ms.map(Duration::from_millis))
  }

  #[test]
  fn test_retain_fresh_drops_only_expired() {
    let now = 10_000;
    let mut snapshot = HashMap::new();
    snapshot.insert("a".to_string(), entry("a", now - 1_500, Some(1_000)));
    snapshot.insert("b".to_string(), entry("b", now - 1_500, None));
    snapshot.insert("c".to_string(), entry("c", now - 1_000, Some(1_000)));

    let kept = retain_fresh(&snapshot, now);

    assert!(!kept.contains_key("a"));
    assert!(kept.contains_key("b"));
    // Exactly at the TTL boundary is still fresh
    assert!(kept.contains_key("c"));
    // The snapshot itself is untouched
    assert_eq!(snapshot.len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_runs_on_interval() {
    let clock = Arc::new(ManualClock::new(10_000));
    let backing = Arc::new(MemoryBacking::new("test"));
    let store = Arc::new(CacheStore::<u32>::new(Arc::new(EvictionManager::new(
      backing,
    ))));
    store.write(entry("a", 9_000, Some(500)));
    store.write(entry("b", 9_000, None));

    let _sweeper = Sweeper::spawn(Arc::downgrade(&store), clock.clone(), Duration::from_secs(60));

    time::sleep(Duration::from_secs(61)).await;
    assert_eq!(store.keys(), vec!["b".to_string()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_stops_when_store_dropped() {
    let clock = Arc::new(ManualClock::new(1));
    let store = Arc::new(CacheStore::<u32>::new(Arc::new(EvictionManager::new(
      Arc::new(MemoryBacking::new("test")),
    ))));
    let sweeper = Sweeper::spawn(Arc::downgrade(&store), clock, Duration::from_secs(1));
    drop(store);

    time::sleep(Duration::from_secs(3)).await;
    assert!(sweeper.handle.is_finished());
  }
}
