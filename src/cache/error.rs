//! Error taxonomy for the cache.
//!
//! Only [`FetchError`] ever reaches a caller. [`StorageError`] describes
//! failures of the persistence layer, which the cache logs and absorbs.

use color_eyre::Report;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failures of the persistent backing and its codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
  #[error("Storage capacity exceeded while writing {key}")]
  CapacityExceeded { key: String },

  #[error("Corrupt cache entry at {key}: {reason}")]
  CorruptEntry { key: String, reason: String },

  #[error("Failed to serialize cache entry {key}: {reason}")]
  Serialization { key: String, reason: String },

  #[error("Storage backend failure: {reason}")]
  Backend { reason: String },

  #[error("Storage lock poisoned")]
  LockPoisoned,
}

impl StorageError {
  pub(crate) fn corrupt(key: &str, reason: impl fmt::Display) -> Self {
    Self::CorruptEntry {
      key: key.to_string(),
      reason: reason.to_string(),
    }
  }

  pub(crate) fn backend(reason: impl fmt::Display) -> Self {
    Self::Backend {
      reason: reason.to_string(),
    }
  }

  pub fn is_capacity(&self) -> bool {
    matches!(self, Self::CapacityExceeded { .. })
  }
}

/// A fetcher failed.
///
/// Cloneable so that every caller joined to the same in-flight fetch
/// observes the identical error.
#[derive(Clone)]
pub struct FetchError(Arc<Report>);

impl FetchError {
  /// The underlying report produced by the fetcher.
  pub fn report(&self) -> &Report {
    &self.0
  }
}

impl From<Report> for FetchError {
  fn from(report: Report) -> Self {
    Self(Arc::new(report))
  }
}

impl fmt::Debug for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fetch failed: {}", self.0)
  }
}

impl std::error::Error for FetchError {}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_fetch_error_clones_share_report() {
    let err = FetchError::from(eyre!("connection reset"));
    let joined = err.clone();
    assert!(Arc::ptr_eq(&err.0, &joined.0));
    assert_eq!(joined.to_string(), "Fetch failed: connection reset");
  }

  #[test]
  fn test_capacity_detection() {
    let full = StorageError::CapacityExceeded {
      key: "products".to_string(),
    };
    assert!(full.is_capacity());
    assert!(!StorageError::LockPoisoned.is_capacity());
  }
}
