//! Cache service that composes the store, coordinator, persistence and sweeper.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::coordinator::{FetchState, PendingFetch, RequestCoordinator};
use super::error::FetchError;
use super::eviction::EvictionManager;
use super::key::Selector;
use super::storage::Backing;
use super::store::CacheStore;
use super::sweeper::Sweeper;
use super::traits::{CacheEntry, CacheResult, CachedValue, Cacheable, ReadOptions};

/// Runtime settings for a [`CacheService`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// How often expired entries are swept; `None` disables the sweeper
  pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      sweep_interval: Some(Duration::from_secs(60)),
    }
  }
}

impl CacheConfig {
  /// Set the sweep interval.
  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval = Some(interval);
    self
  }

  /// Disable the periodic sweep.
  pub fn without_sweeper(mut self) -> Self {
    self.sweep_interval = None;
    self
  }
}

struct Inner<T: Cacheable> {
  store: Arc<CacheStore<T>>,
  coordinator: Arc<RequestCoordinator<T>>,
  clock: Arc<dyn Clock>,
  _sweeper: Option<Sweeper>,
}

/// Application cache for one payload type.
///
/// Create one per session and hand clones to whoever needs it; clones share
/// state. Reads and writes are synchronous over memory, persistence happens
/// in the background, and fetches are deduplicated per key.
pub struct CacheService<T: Cacheable> {
  inner: Arc<Inner<T>>,
}

impl<T: Cacheable> CacheService<T> {
  /// Create a cache over `backing`, hydrating it from whatever is persisted.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(backing: impl Backing + 'static, config: CacheConfig) -> Self {
    Self::with_clock(backing, config, Arc::new(SystemClock))
  }

  /// Like [`CacheService::new`], with an explicit time source.
  pub fn with_clock(
    backing: impl Backing + 'static,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let evictions = Arc::new(EvictionManager::new(Arc::new(backing)));
    let store = Arc::new(CacheStore::new(evictions));
    store.hydrate();

    let coordinator = Arc::new(RequestCoordinator::new(store.clone(), clock.clone()));
    let sweeper = config
      .sweep_interval
      .map(|interval| Sweeper::spawn(Arc::downgrade(&store), clock.clone(), interval));

    Self {
      inner: Arc::new(Inner {
        store,
        coordinator,
        clock,
        _sweeper: sweeper,
      }),
    }
  }

  fn now_ms(&self) -> i64 {
    self.inner.clock.now_ms()
  }

  /// Read a cached value.
  ///
  /// Expired entries read as absent unless `options.skip_expiry` is set.
  pub fn get_cached(
    &self,
    key: impl AsRef<str>,
    options: ReadOptions,
  ) -> Option<CachedValue<T>> {
    let entry = self.inner.store.read(key.as_ref())?;
    let value = CachedValue::from_entry(&entry, self.now_ms());
    if value.is_expired && !options.skip_expiry {
      return None;
    }
    Some(value)
  }

  /// Store a value obtained outside the fetch machinery.
  ///
  /// Returns false if the clock reported a non-positive time and the value
  /// was not cached.
  pub fn set_cached(&self, key: impl AsRef<str>, data: T, ttl: Option<Duration>) -> bool {
    let entry = CacheEntry::new(key.as_ref(), data, self.now_ms(), ttl);
    self.inner.store.write(entry)
  }

  /// Remove every entry the selector matches. Returns the number removed.
  ///
  /// `"*"` selects everything, any other string one exact key, and a
  /// [`regex::Regex`] every key it matches.
  pub fn invalidate(&self, selector: impl Into<Selector>) -> usize {
    let selector = selector.into();
    let removed = self.inner.store.remove_matching(&selector);
    debug!(?selector, removed, "Invalidated cache entries");
    removed
  }

  /// Fetch `key`, or join the fetch already pending for it.
  ///
  /// A successful result is cached with `ttl`; a failure leaves any existing
  /// entry untouched.
  pub fn fetch<F, Fut>(
    &self,
    key: impl AsRef<str>,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> PendingFetch<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.inner.coordinator.fetch(key.as_ref(), fetcher, ttl)
  }

  /// Drop the cached entry and fetch it again.
  ///
  /// If a fetch for the key is already pending, the refresh joins it.
  pub fn refresh<F, Fut>(
    &self,
    key: impl AsRef<str>,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> PendingFetch<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.as_ref();
    self.invalidate(Selector::Exact(key.to_string()));
    self.fetch(key, fetcher, ttl)
  }

  /// Warm the cache in the background unless a fresh entry already exists.
  ///
  /// Returns whether a fetch was started or joined. The outcome is only logged.
  pub fn preload<F, Fut>(&self, key: impl AsRef<str>, fetcher: F, ttl: Option<Duration>) -> bool
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.as_ref();
    if self.get_cached(key, ReadOptions::default()).is_some() {
      return false;
    }

    let pending = self.fetch(key, fetcher, ttl);
    let key = key.to_string();
    tokio::spawn(async move {
      match pending.await {
        Ok(_) => debug!(key = %key, "Preloaded cache entry"),
        Err(e) => warn!(key = %key, error = %e, "Preload failed"),
      }
    });
    true
  }

  /// Stale-while-revalidate read.
  ///
  /// 1. Fresh entry - return it
  /// 2. Expired entry - return it immediately and refresh in the background;
  ///    if the refresh fails the stale entry keeps being served
  /// 3. No entry - wait for the fetch
  pub async fn get_or_revalidate<F, Fut>(
    &self,
    key: impl AsRef<str>,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> Result<CacheResult<T>, FetchError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.as_ref();
    match self.get_cached(key, ReadOptions::skip_expiry()) {
      Some(cached) if !cached.is_expired => Ok(CacheResult::from_cache(cached)),
      Some(stale) => {
        let pending = self.fetch(key, fetcher, ttl);
        let key = key.to_string();
        tokio::spawn(async move {
          if let Err(e) = pending.await {
            warn!(key = %key, error = %e, "Background refresh failed, serving stale entry");
          }
        });
        Ok(CacheResult::from_cache(stale))
      }
      None => {
        let data = self.fetch(key, fetcher, ttl).await?;
        Ok(CacheResult::from_network(data))
      }
    }
  }

  /// Cache-first read with offline fallback.
  ///
  /// 1. Fresh entry - return it
  /// 2. Otherwise wait for the fetch
  /// 3. If the fetch fails, return the expired entry if there is one
  pub async fn get_or_fetch<F, Fut>(
    &self,
    key: impl AsRef<str>,
    fetcher: F,
    ttl: Option<Duration>,
  ) -> Result<CacheResult<T>, FetchError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.as_ref();
    let cached = self.get_cached(key, ReadOptions::skip_expiry());
    if let Some(fresh) = cached.as_ref().filter(|c| !c.is_expired) {
      return Ok(CacheResult::from_cache(fresh.clone()));
    }

    match self.fetch(key, fetcher, ttl).await {
      Ok(data) => Ok(CacheResult::from_network(data)),
      Err(e) => match cached {
        Some(stale) => {
          warn!(key, error = %e, "Fetch failed, serving expired entry");
          Ok(CacheResult::offline(stale))
        }
        None => Err(e),
      },
    }
  }

  /// Forget everything, in memory and on disk.
  ///
  /// Fetches still pending finish for their callers, but their results are
  /// not cached.
  pub fn teardown(&self) {
    let generation = self.inner.store.teardown();
    let abandoned = self.inner.coordinator.clear();
    info!(generation, abandoned, "Cache torn down");
  }

  /// Wait until the persistent backing reflects every change made so far.
  pub async fn flush(&self) {
    self.inner.store.flush().await;
  }

  /// Run one expiration pass now. Returns the number of entries removed.
  pub fn sweep_now(&self) -> usize {
    self.inner.store.sweep(self.now_ms()).len()
  }

  /// Every cached key, sorted.
  pub fn keys(&self) -> Vec<String> {
    self.inner.store.keys()
  }

  /// Every cached entry, sorted by key.
  pub fn entries(&self) -> Vec<CacheEntry<T>> {
    let mut entries: Vec<_> = self.inner.store.snapshot().into_values().collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  pub fn len(&self) -> usize {
    self.inner.store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.store.is_empty()
  }

  pub fn in_flight_count(&self) -> usize {
    self.inner.coordinator.in_flight_count()
  }

  pub fn fetch_state(&self, key: impl AsRef<str>) -> Option<FetchState<T>> {
    self.inner.coordinator.state(key.as_ref())
  }
}

impl<T: Cacheable> Clone for CacheService<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
