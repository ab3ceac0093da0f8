//! In-memory source of truth, mirrored to the persistent backing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::codec;
use super::eviction::EvictionManager;
use super::key::Selector;
use super::sweeper;
use super::traits::{CacheEntry, Cacheable};
use super::writer::{self, PersistOp};

struct StoreState<T> {
  entries: HashMap<String, CacheEntry<T>>,
  /// Bumped on teardown; fetch settlements carrying an older value are dropped
  generation: u64,
}

/// Key → entry map kept in sync with the persistent backing.
///
/// Memory is updated synchronously. The matching persistence operation is
/// queued while the state lock is held, so the backing sees mutations in the
/// same order as memory does.
pub struct CacheStore<T> {
  state: Mutex<StoreState<T>>,
  evictions: Arc<EvictionManager>,
  persist: mpsc::UnboundedSender<PersistOp>,
}

impl<T: Cacheable> CacheStore<T> {
  /// Create an empty store and spawn its persistence writer.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(evictions: Arc<EvictionManager>) -> Self {
    let persist = writer::spawn(evictions.clone());
    Self {
      state: Mutex::new(StoreState {
        entries: HashMap::new(),
        generation: 0,
      }),
      evictions,
      persist,
    }
  }

  /// Load every valid persisted entry into memory, purging corrupt ones.
  ///
  /// Returns the number of entries loaded.
  pub fn hydrate(&self) -> usize {
    let backing = self.evictions.backing();
    let keys = match backing.list_keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "Failed to list persisted cache entries");
        return 0;
      }
    };

    let mut loaded = HashMap::with_capacity(keys.len());
    for key in keys {
      let raw = match backing.get(&key) {
        Ok(Some(raw)) => raw,
        Ok(None) => continue,
        Err(e) => {
          warn!(key = %key, error = %e, "Failed to read persisted cache entry");
          continue;
        }
      };
      match codec::decode::<T>(&key, &raw) {
        Ok(entry) => {
          loaded.insert(key, entry);
        }
        Err(e) => {
          warn!(error = %e, "Purging corrupt cache entry");
          self.queue(PersistOp::Remove(key));
        }
      }
    }

    let count = loaded.len();
    let mut state = self.lock();
    for (key, entry) in loaded {
      state.entries.entry(key).or_insert(entry);
    }
    debug!(count, "Hydrated cache from persistent backing");
    count
  }

  pub fn read(&self, key: &str) -> Option<CacheEntry<T>> {
    self.lock().entries.get(key).cloned()
  }

  /// Insert or replace an entry. Returns false if the entry was rejected.
  pub fn write(&self, entry: CacheEntry<T>) -> bool {
    if !admissible(&entry) {
      return false;
    }
    let op = self.persist_op_for(&entry);
    let mut state = self.lock();
    state.entries.insert(entry.key.clone(), entry);
    self.queue(op);
    true
  }

  /// Insert an entry only if no teardown happened since `generation` was read.
  pub fn write_if_generation(&self, entry: CacheEntry<T>, generation: u64) -> bool {
    if !admissible(&entry) {
      return false;
    }
    let op = self.persist_op_for(&entry);
    let mut state = self.lock();
    if state.generation != generation {
      return false;
    }
    state.entries.insert(entry.key.clone(), entry);
    self.queue(op);
    true
  }

  pub fn remove(&self, key: &str) -> bool {
    let mut state = self.lock();
    let removed = state.entries.remove(key).is_some();
    // The backing may hold a copy memory never had (e.g. a purged hydrate)
    self.queue(PersistOp::Remove(key.to_string()));
    removed
  }

  /// Remove every entry the selector matches. Returns the number removed.
  pub fn remove_matching(&self, selector: &Selector) -> usize {
    match selector {
      Selector::All => {
        let removed = self.lock().entries.len();
        self.clear_all();
        removed
      }
      Selector::Exact(key) => usize::from(self.remove(key)),
      Selector::Pattern(_) => {
        let mut state = self.lock();
        let doomed: Vec<String> = state
          .entries
          .keys()
          .filter(|key| selector.matches(key))
          .cloned()
          .collect();
        for key in &doomed {
          state.entries.remove(key);
          self.queue(PersistOp::Remove(key.clone()));
        }
        doomed.len()
      }
    }
  }

  /// Empty memory now and schedule a clear of the backing.
  pub fn clear_all(&self) {
    let mut state = self.lock();
    state.entries.clear();
    self.queue(PersistOp::Clear);
  }

  /// Clear everything and start a new generation. Returns the new generation.
  pub fn teardown(&self) -> u64 {
    let mut state = self.lock();
    state.generation += 1;
    state.entries.clear();
    self.queue(PersistOp::Clear);
    state.generation
  }

  pub fn generation(&self) -> u64 {
    self.lock().generation
  }

  /// Drop every entry older than its TTL. Returns the removed keys.
  pub fn sweep(&self, now_ms: i64) -> Vec<String> {
    let mut state = self.lock();
    let kept = sweeper::retain_fresh(&state.entries, now_ms);
    let removed: Vec<String> = state
      .entries
      .keys()
      .filter(|key| !kept.contains_key(*key))
      .cloned()
      .collect();
    state.entries = kept;
    for key in &removed {
      self.queue(PersistOp::Remove(key.clone()));
    }
    removed
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn snapshot(&self) -> HashMap<String, CacheEntry<T>> {
    self.lock().entries.clone()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Wait until every queued persistence operation has been applied.
  pub async fn flush(&self) {
    let (ack, done) = oneshot::channel();
    self.queue(PersistOp::Flush(ack));
    let _ = done.await;
  }

  /// Encoding happens outside the lock; an unencodable entry still replaces
  /// any older persisted copy of its key.
  fn persist_op_for(&self, entry: &CacheEntry<T>) -> PersistOp {
    match codec::encode(entry) {
      Ok(raw) => PersistOp::Write {
        key: entry.key.clone(),
        raw,
      },
      Err(e) => {
        warn!(error = %e, "Keeping cache entry in memory only");
        PersistOp::Remove(entry.key.clone())
      }
    }
  }

  fn queue(&self, op: PersistOp) {
    if self.persist.send(op).is_err() {
      debug!("Persistence writer stopped, skipping backing update");
    }
  }

  fn lock(&self) -> MutexGuard<'_, StoreState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Hydration discards entries without a positive timestamp, so they are
/// never admitted in the first place.
fn admissible<T>(entry: &CacheEntry<T>) -> bool {
  if entry.timestamp > 0 {
    return true;
  }
  warn!(
    key = %entry.key,
    timestamp = entry.timestamp,
    "Rejecting cache entry without a positive timestamp"
  );
  false
}
