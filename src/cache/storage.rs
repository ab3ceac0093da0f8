//! Persistent backing trait and its implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::StorageError;

/// A namespaced key → string store with bounded capacity.
///
/// Keys passed in and returned are cache keys; implementations apply their
/// namespace prefix so the cache can share a physical store with unrelated
/// state. Only `set` is expected to fail in normal operation, with
/// [`StorageError::CapacityExceeded`].
pub trait Backing: Send + Sync {
  /// Get the raw stored string for a key.
  fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

  /// Store a raw string, replacing any previous value.
  fn set(&self, key: &str, raw: &str) -> Result<(), StorageError>;

  /// Remove a key. Removing an absent key is a no-op.
  fn remove(&self, key: &str) -> Result<(), StorageError>;

  /// Remove every key in this namespace.
  fn clear(&self) -> Result<(), StorageError>;

  /// Enumerate the keys in this namespace.
  fn list_keys(&self) -> Result<Vec<String>, StorageError>;
}

impl<B: Backing + ?Sized> Backing for Arc<B> {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    (**self).get(key)
  }

  fn set(&self, key: &str, raw: &str) -> Result<(), StorageError> {
    (**self).set(key, raw)
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    (**self).remove(key)
  }

  fn clear(&self) -> Result<(), StorageError> {
    (**self).clear()
  }

  fn list_keys(&self) -> Result<Vec<String>, StorageError> {
    (**self).list_keys()
  }
}

fn prefix_for(namespace: &str) -> String {
  format!("{}:", namespace)
}

/// Backing that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopBacking;

impl Backing for NoopBacking {
  fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _raw: &str) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    Ok(())
  }

  fn list_keys(&self) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }
}

/// In-process backing with a byte budget.
///
/// The physical map may hold keys from other namespaces; capacity counts
/// only this namespace's values.
pub struct MemoryBacking {
  prefix: String,
  capacity_bytes: Option<usize>,
  map: Mutex<BTreeMap<String, String>>,
}

impl MemoryBacking {
  pub fn new(namespace: &str) -> Self {
    Self {
      prefix: prefix_for(namespace),
      capacity_bytes: None,
      map: Mutex::new(BTreeMap::new()),
    }
  }

  /// Limit the total size of stored values in this namespace.
  pub fn with_capacity(mut self, bytes: usize) -> Self {
    self.capacity_bytes = Some(bytes);
    self
  }

  /// Every physical key, including those outside the namespace.
  pub fn raw_keys(&self) -> Vec<String> {
    self
      .map
      .lock()
      .map(|map| map.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Insert a physical key verbatim, bypassing namespace and capacity.
  pub fn insert_raw(&self, physical_key: &str, raw: &str) {
    if let Ok(mut map) = self.map.lock() {
      map.insert(physical_key.to_string(), raw.to_string());
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
    self.map.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl Backing for MemoryBacking {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let map = self.lock()?;
    Ok(map.get(&format!("{}{}", self.prefix, key)).cloned())
  }

  fn set(&self, key: &str, raw: &str) -> Result<(), StorageError> {
    let mut map = self.lock()?;
    let physical = format!("{}{}", self.prefix, key);

    if let Some(capacity) = self.capacity_bytes {
      let used: usize = map
        .iter()
        .filter(|(k, _)| k.starts_with(&self.prefix) && **k != physical)
        .map(|(_, v)| v.len())
        .sum();
      if used + raw.len() > capacity {
        return Err(StorageError::CapacityExceeded {
          key: key.to_string(),
        });
      }
    }

    map.insert(physical, raw.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let mut map = self.lock()?;
    map.remove(&format!("{}{}", self.prefix, key));
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    let mut map = self.lock()?;
    map.retain(|k, _| !k.starts_with(&self.prefix));
    Ok(())
  }

  fn list_keys(&self) -> Result<Vec<String>, StorageError> {
    let map = self.lock()?;
    Ok(
      map
        .keys()
        .filter_map(|k| k.strip_prefix(&self.prefix))
        .map(String::from)
        .collect(),
    )
  }
}

/// SQLite-based backing.
pub struct SqliteBacking {
  conn: Mutex<Connection>,
  prefix: String,
  capacity_bytes: Option<u64>,
}

impl SqliteBacking {
  /// Open (or create) a database file.
  pub fn open(path: &Path, namespace: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn, namespace)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(namespace: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn, namespace)
  }

  fn from_connection(conn: Connection, namespace: &str) -> Result<Self> {
    let backing = Self {
      conn: Mutex::new(conn),
      prefix: prefix_for(namespace),
      capacity_bytes: None,
    };
    backing.run_migrations()?;
    Ok(backing)
  }

  /// Limit the total size of stored values in this namespace.
  pub fn with_capacity(mut self, bytes: u64) -> Self {
    self.capacity_bytes = Some(bytes);
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hoard").join("cache.db"))
  }

  /// Run database migrations for the key-value table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }

  fn physical(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }
}

/// Schema for the shared key-value table.
const KV_SCHEMA: &str = r#"
-- Flat key-value store; each namespace owns the keys sharing its prefix
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Map a rusqlite error, recognising a full database as a capacity failure.
fn map_sqlite_error(key: &str, e: rusqlite::Error) -> StorageError {
  match e.sqlite_error_code() {
    Some(ErrorCode::DiskFull) => StorageError::CapacityExceeded {
      key: key.to_string(),
    },
    _ => StorageError::backend(e),
  }
}

impl Backing for SqliteBacking {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![self.physical(key)],
        |row| row.get(0),
      )
      .optional()
      .map_err(StorageError::backend)
  }

  fn set(&self, key: &str, raw: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    let physical = self.physical(key);

    if let Some(capacity) = self.capacity_bytes {
      let used: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM kv_store
           WHERE substr(key, 1, length(?1)) = ?1 AND key != ?2",
          params![self.prefix, physical],
          |row| row.get(0),
        )
        .map_err(StorageError::backend)?;
      let used = u64::try_from(used).unwrap_or(0);
      if used + raw.len() as u64 > capacity {
        return Err(StorageError::CapacityExceeded {
          key: key.to_string(),
        });
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
        params![physical, raw],
      )
      .map_err(|e| map_sqlite_error(key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM kv_store WHERE key = ?",
        params![self.physical(key)],
      )
      .map_err(StorageError::backend)?;
    Ok(())
  }

  fn clear(&self) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM kv_store WHERE substr(key, 1, length(?1)) = ?1",
        params![self.prefix],
      )
      .map_err(StorageError::backend)?;
    Ok(())
  }

  fn list_keys(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(StorageError::backend)?;

    let keys = stmt
      .query_map(params![self.prefix], |row| row.get::<_, String>(0))
      .map_err(StorageError::backend)?
      .filter_map(|r| r.ok())
      .filter_map(|k| k.strip_prefix(&self.prefix).map(String::from))
      .collect();

    Ok(keys)
  }
}
