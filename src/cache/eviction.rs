//! Capacity-aware writes to the persistent backing.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::codec;
use super::error::StorageError;
use super::storage::Backing;

/// Serializes every mutation of the persistent backing and recovers from
/// capacity failures by evicting the oldest stored entry.
///
/// Reads go straight to [`EvictionManager::backing`] without taking the lock.
pub struct EvictionManager {
  backing: Arc<dyn Backing>,
  write_lock: Mutex<()>,
}

impl EvictionManager {
  pub fn new(backing: Arc<dyn Backing>) -> Self {
    Self {
      backing,
      write_lock: Mutex::new(()),
    }
  }

  pub fn backing(&self) -> &dyn Backing {
    self.backing.as_ref()
  }

  /// Write a value, evicting the globally oldest entry and retrying once if
  /// the backing is full.
  pub fn write_with_eviction(&self, key: &str, raw: &str) -> Result<(), StorageError> {
    let _guard = self.lock()?;

    match self.backing.set(key, raw) {
      Ok(()) => return Ok(()),
      Err(e) if e.is_capacity() => {
        debug!(key, "Backing full, looking for an eviction victim");
      }
      Err(e) => {
        warn!(key, error = %e, "Failed to persist cache entry");
        return Err(e);
      }
    }

    let Some(victim) = self.oldest_entry(key) else {
      warn!(key, "Backing full and nothing to evict, keeping entry in memory only");
      self.drop_stale_copy(key);
      return Err(StorageError::CapacityExceeded {
        key: key.to_string(),
      });
    };

    debug!(key, victim = %victim, "Evicting oldest cache entry");
    self.backing.remove(&victim)?;

    self.backing.set(key, raw).inspect_err(|e| {
      warn!(key, error = %e, "Retry after eviction failed, keeping entry in memory only");
      self.drop_stale_copy(key);
    })
  }

  /// A value that could not be written must not leave an older one behind.
  fn drop_stale_copy(&self, key: &str) {
    if let Err(e) = self.backing.remove(key) {
      warn!(key, error = %e, "Failed to remove outdated persisted cache entry");
    }
  }

  /// Remove a single key.
  pub fn remove(&self, key: &str) -> Result<(), StorageError> {
    let _guard = self.lock()?;
    self.backing.remove(key)
  }

  /// Remove every key in the backing's namespace.
  pub fn clear(&self) -> Result<(), StorageError> {
    let _guard = self.lock()?;
    self.backing.clear()
  }

  /// Find the stored entry with the smallest timestamp, other than `writing`.
  ///
  /// The key being written is skipped: backings already leave its old value
  /// out of the capacity check. Corrupt entries found along the way are
  /// purged. Must be called with the write lock held.
  fn oldest_entry(&self, writing: &str) -> Option<String> {
    let keys = match self.backing.list_keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "Failed to list keys for eviction");
        return None;
      }
    };

    let mut oldest: Option<(i64, String)> = None;
    for key in keys {
      if key == writing {
        continue;
      }
      let Ok(Some(raw)) = self.backing.get(&key) else {
        continue;
      };
      match codec::envelope_timestamp(&key, &raw) {
        Ok(timestamp) => {
          if oldest.as_ref().map_or(true, |(ts, _)| timestamp < *ts) {
            oldest = Some((timestamp, key));
          }
        }
        Err(e) => {
          warn!(error = %e, "Purging corrupt cache entry");
          let _ = self.backing.remove(&key);
        }
      }
    }

    oldest.map(|(_, key)| key)
  }

  fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
    self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)
  }
}
