//! Deduplication of concurrent fetches.
//!
//! Each key has at most one pending fetch. Callers arriving while it is
//! pending receive a clone of the same shared future, so the fetcher runs
//! once and every caller observes the same value or the same error.
//!
//! An in-flight fetch moves through `Pending -> Fulfilled | Rejected`. The
//! in-flight map only ever holds pending operations: the spawned task
//! removes its own marker as part of settling.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::clock::Clock;
use super::error::FetchError;
use super::store::CacheStore;
use super::traits::{CacheEntry, Cacheable};

/// A fetch that may still be running. Clone it to wait on it from several places.
pub type PendingFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// The state of an in-flight fetch
#[derive(Debug, Clone)]
pub enum FetchState<T> {
  /// The fetcher has not settled yet
  Pending,
  /// The fetcher produced a value
  Fulfilled(T),
  /// The fetcher failed
  Rejected(FetchError),
}

impl<T: Clone> FetchState<T> {
  /// Inspect a fetch handle without waiting on it.
  pub fn of(pending: &PendingFetch<T>) -> Self {
    match pending.peek() {
      None => FetchState::Pending,
      Some(Ok(data)) => FetchState::Fulfilled(data.clone()),
      Some(Err(e)) => FetchState::Rejected(e.clone()),
    }
  }
}

impl<T> FetchState<T> {
  pub fn is_pending(&self) -> bool {
    matches!(self, FetchState::Pending)
  }

  pub fn is_fulfilled(&self) -> bool {
    matches!(self, FetchState::Fulfilled(_))
  }

  pub fn is_rejected(&self) -> bool {
    matches!(self, FetchState::Rejected(_))
  }
}

struct InFlight<T> {
  id: u64,
  future: PendingFetch<T>,
}

/// Tracks pending fetches and writes successful results through to the store.
pub struct RequestCoordinator<T> {
  store: Arc<CacheStore<T>>,
  clock: Arc<dyn Clock>,
  in_flight: Mutex<HashMap<String, InFlight<T>>>,
  next_id: AtomicU64,
}

impl<T: Cacheable> RequestCoordinator<T> {
  pub fn new(store: Arc<CacheStore<T>>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      in_flight: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(0),
    }
  }

  /// Fetch `key`, or join the fetch already pending for it.
  ///
  /// The new operation is registered before this returns, and the fetcher
  /// runs on its own task: it settles (and updates the cache) even if every
  /// returned handle is dropped. Must be called from within a tokio runtime.
  pub fn fetch<F, Fut>(
    self: &Arc<Self>,
    key: &str,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> PendingFetch<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let mut in_flight = self.lock();
    if let Some(pending) = in_flight.get(key) {
      debug!(key, "Joining in-flight fetch");
      return pending.future.clone();
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let generation = self.store.generation();
    let this = Arc::clone(self);
    let task_key = key.to_string();

    let task = tokio::spawn(async move {
      let result = match AssertUnwindSafe(async move { fetcher().await })
        .catch_unwind()
        .await
      {
        Ok(result) => result.map_err(FetchError::from),
        Err(_) => Err(FetchError::from(eyre!("Fetcher for {} panicked", task_key))),
      };
      this.settle(&task_key, id, generation, ttl, &result);
      result
    });

    let future = async move {
      task
        .await
        .unwrap_or_else(|e| Err(FetchError::from(eyre!("Fetch task failed: {}", e))))
    }
    .boxed()
    .shared();

    debug!(key, "Starting fetch");
    in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        future: future.clone(),
      },
    );
    future
  }

  /// State of the fetch currently registered for `key`, if any.
  pub fn state(&self, key: &str) -> Option<FetchState<T>> {
    let in_flight = self.lock();
    in_flight.get(key).map(|pending| FetchState::of(&pending.future))
  }

  pub fn in_flight_count(&self) -> usize {
    self.lock().len()
  }

  /// Forget every pending marker. Running fetchers still settle, but new
  /// calls start fresh instead of joining them.
  pub fn clear(&self) -> usize {
    let mut in_flight = self.lock();
    let count = in_flight.len();
    in_flight.clear();
    count
  }

  fn settle(
    &self,
    key: &str,
    id: u64,
    generation: u64,
    ttl: Option<Duration>,
    result: &std::result::Result<T, FetchError>,
  ) {
    match result {
      Ok(data) => {
        let entry = CacheEntry::new(key, data.clone(), self.clock.now_ms(), ttl);
        if !self.store.write_if_generation(entry, generation) {
          debug!(key, "Fetch result not cached");
        }
      }
      Err(e) => {
        debug!(key, error = %e, "Fetch failed, cached entry left untouched");
      }
    }

    let mut in_flight = self.lock();
    if in_flight.get(key).is_some_and(|pending| pending.id == id) {
      in_flight.remove(key);
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::eviction::EvictionManager;
  use crate::cache::storage::MemoryBacking;
  use std::sync::atomic::AtomicU32;
  use tokio::sync::oneshot;

  fn setup() -> (Arc<CacheStore<String>>, Arc<RequestCoordinator<String>>) {
    let backing = Arc::new(MemoryBacking::new("test"));
    let store = Arc::new(CacheStore::new(Arc::new(EvictionManager::new(backing))));
    let clock = Arc::new(ManualClock::new(1_000_000));
    let coordinator = Arc::new(RequestCoordinator::new(store.clone(), clock));
    (store, coordinator)
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_fetcher() {
    let (store, coordinator) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..5)
      .map(|_| {
        let calls = calls.clone();
        coordinator.fetch(
          "products",
          move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("catalog".to_string())
          },
          Some(Duration::from_secs(5)),
        )
      })
      .collect();

    assert_eq!(coordinator.in_flight_count(), 1);
    let results = futures::future::join_all(handles).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
      assert_eq!(result.unwrap(), "catalog");
    }
    assert_eq!(store.read("products").unwrap().data, "catalog");
    assert_eq!(store.read("products").unwrap().ttl, Some(5_000));
    assert_eq!(coordinator.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_joined_callers_see_identical_error() {
    let (_store, coordinator) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let fetcher = |calls: Arc<AtomicU32>| {
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<String, _>(eyre!("upstream unavailable"))
      }
    };
    let first = coordinator.fetch("orders", fetcher(calls.clone()), None);
    let second = coordinator.fetch("orders", fetcher(calls.clone()), None);

    let (a, b) = tokio::join!(first, second);
    let (a, b) = (a.unwrap_err(), b.unwrap_err());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(std::ptr::eq(a.report(), b.report()));
    assert!(a.to_string().contains("upstream unavailable"));
  }

  #[tokio::test]
  async fn test_failure_keeps_previous_entry() {
    let (store, coordinator) = setup();
    store.write(CacheEntry::new("prices", "old".to_string(), 10, None));

    let pending = coordinator.fetch("prices", || async { Err(eyre!("timeout")) }, None);
    let result = pending.clone().await;

    assert!(result.is_err());
    assert!(FetchState::of(&pending).is_rejected());
    assert_eq!(store.read("prices").unwrap().data, "old");
    assert_eq!(coordinator.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_sequential_fetches_invoke_fetcher_again() {
    let (store, coordinator) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    for expected in 1..=2 {
      let calls = calls.clone();
      let value = coordinator
        .fetch(
          "counter",
          move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst).to_string()) },
          None,
        )
        .await
        .unwrap();
      assert_eq!(value, (expected - 1).to_string());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.read("counter").unwrap().data, "1");
  }

  #[tokio::test]
  async fn test_state_is_pending_until_settled() {
    let (_store, coordinator) = setup();
    let (release, gate) = oneshot::channel::<()>();

    let pending = coordinator.fetch(
      "slow",
      move || async move {
        let _ = gate.await;
        Ok("done".to_string())
      },
      None,
    );

    assert!(coordinator.state("slow").unwrap().is_pending());
    assert!(coordinator.state("other").is_none());

    release.send(()).unwrap();
    assert_eq!(pending.clone().await.unwrap(), "done");
    assert!(coordinator.state("slow").is_none());
    assert!(FetchState::of(&pending).is_fulfilled());
  }

  #[tokio::test]
  async fn test_settlement_after_teardown_is_discarded() {
    let (store, coordinator) = setup();
    let (release, gate) = oneshot::channel::<()>();

    let pending = coordinator.fetch(
      "k",
      move || async move {
        let _ = gate.await;
        Ok("from before teardown".to_string())
      },
      None,
    );

    store.teardown();
    coordinator.clear();
    release.send(()).unwrap();

    // The caller still gets its value; the cache does not
    assert_eq!(pending.await.unwrap(), "from before teardown");
    assert!(store.read("k").is_none());
  }

  #[tokio::test]
  async fn test_stale_settlement_does_not_remove_newer_marker() {
    let (_store, coordinator) = setup();
    let (release_old, old_gate) = oneshot::channel::<()>();
    let (release_new, new_gate) = oneshot::channel::<()>();

    let old = coordinator.fetch(
      "k",
      move || async move {
        let _ = old_gate.await;
        Ok("old".to_string())
      },
      None,
    );
    coordinator.clear();
    let new = coordinator.fetch(
      "k",
      move || async move {
        let _ = new_gate.await;
        Ok("new".to_string())
      },
      None,
    );

    release_old.send(()).unwrap();
    old.await.unwrap();
    assert!(coordinator.state("k").unwrap().is_pending());

    release_new.send(()).unwrap();
    assert_eq!(new.await.unwrap(), "new");
    assert_eq!(coordinator.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_panicking_fetcher_becomes_fetch_error() {
    let (_store, coordinator) = setup();

    let result = coordinator
      .fetch(
        "boom",
        || async {
          if true {
            panic!("fetcher bug");
          }
          Ok("unreachable".to_string())
        },
        None,
      )
      .await;

    assert!(result.unwrap_err().to_string().contains("panicked"));
    assert_eq!(coordinator.in_flight_count(), 0);
  }
}
