//! Storable string form of cache entries.
//!
//! Entries are persisted as JSON envelopes:
//! `{"key": "...", "data": <payload>, "timestamp": <ms>, "ttl": <ms>|null}`.
//! Decoding validates the envelope before any payload is surfaced.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use super::error::StorageError;
use super::traits::CacheEntry;

/// Serialize an entry for the persistent backing.
pub fn encode<T: Serialize>(entry: &CacheEntry<T>) -> Result<String, StorageError> {
  serde_json::to_string(entry).map_err(|e| StorageError::Serialization {
    key: entry.key.clone(),
    reason: e.to_string(),
  })
}

/// Parse and validate a stored envelope.
///
/// The stored key is authoritative for the entry's key.
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<CacheEntry<T>, StorageError> {
  let mut envelope = parse_envelope(key, raw)?;
  let timestamp = validate_timestamp(key, &envelope)?;
  let ttl = validate_ttl(key, &envelope)?;

  let data = envelope
    .remove("data")
    .ok_or_else(|| StorageError::corrupt(key, "missing data"))?;
  let data = serde_json::from_value(data).map_err(|e| StorageError::corrupt(key, e))?;

  Ok(CacheEntry {
    key: key.to_string(),
    data,
    timestamp,
    ttl,
  })
}

/// Validate an envelope's shape and return its timestamp without decoding the payload.
pub fn envelope_timestamp(key: &str, raw: &str) -> Result<i64, StorageError> {
  let envelope = parse_envelope(key, raw)?;
  if !envelope.contains_key("data") {
    return Err(StorageError::corrupt(key, "missing data"));
  }
  validate_ttl(key, &envelope)?;
  validate_timestamp(key, &envelope)
}

fn parse_envelope(key: &str, raw: &str) -> Result<Map<String, Value>, StorageError> {
  match serde_json::from_str::<Value>(raw) {
    Ok(Value::Object(map)) => Ok(map),
    Ok(_) => Err(StorageError::corrupt(key, "envelope is not an object")),
    Err(e) => Err(StorageError::corrupt(key, e)),
  }
}

fn validate_timestamp(key: &str, envelope: &Map<String, Value>) -> Result<i64, StorageError> {
  match envelope.get("timestamp") {
    Some(Value::Number(n)) => match n.as_i64() {
      Some(ts) if ts > 0 => Ok(ts),
      _ => Err(StorageError::corrupt(
        key,
        format!("timestamp {} is not a positive integer", n),
      )),
    },
    Some(other) => Err(StorageError::corrupt(
      key,
      format!("timestamp {} is not numeric", other),
    )),
    None => Err(StorageError::corrupt(key, "missing timestamp")),
  }
}

fn validate_ttl(key: &str, envelope: &Map<String, Value>) -> Result<Option<u64>, StorageError> {
  match envelope.get("ttl") {
    Some(Value::Null) => Ok(None),
    Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
      StorageError::corrupt(key, format!("ttl {} is not a non-negative integer", n))
    }),
    Some(other) => Err(StorageError::corrupt(
      key,
      format!("ttl {} is not numeric", other),
    )),
    None => Err(StorageError::corrupt(key, "missing ttl")),
  }
}
