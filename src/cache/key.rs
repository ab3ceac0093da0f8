//! Cache key construction and invalidation selectors.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Identifies one logical resource.
///
/// Parameterized keys serialize their parameters as a JSON object with
/// sorted keys, so the order parameters were supplied in never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(base: impl Into<String>) -> Self {
    Self(base.into())
  }

  pub fn builder(base: impl Into<String>) -> CacheKeyBuilder {
    CacheKeyBuilder {
      base: base.into(),
      params: Map::new(),
    }
  }

  /// Build a key from any serializable parameter set (usually a struct or map).
  pub fn with_params<P: Serialize + ?Sized>(
    base: impl Into<String>,
    params: &P,
  ) -> Result<Self, serde_json::Error> {
    let base = base.into();
    match serde_json::to_value(params)? {
      Value::Null => Ok(Self(base)),
      Value::Object(map) if map.is_empty() => Ok(Self(base)),
      value => Ok(Self(join(&base, &value))),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// `serde_json::Map` is ordered by key, so serialization is canonical.
fn join(base: &str, params: &Value) -> String {
  format!("{}:{}", base, params)
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

impl From<&str> for CacheKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for CacheKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

/// Incremental builder for parameterized keys.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
  base: String,
  params: Map<String, Value>,
}

impl CacheKeyBuilder {
  pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn build(self) -> CacheKey {
    if self.params.is_empty() {
      CacheKey(self.base)
    } else {
      CacheKey(join(&self.base, &Value::Object(self.params)))
    }
  }
}

/// Which entries an invalidation removes.
#[derive(Debug, Clone)]
pub enum Selector {
  /// Every entry
  All,
  /// Exactly one key
  Exact(String),
  /// Every key the pattern matches
  Pattern(Regex),
}

impl Selector {
  /// The literal that selects everything.
  pub const ALL_MARKER: &'static str = "*";

  pub fn matches(&self, key: &str) -> bool {
    match self {
      Self::All => true,
      Self::Exact(exact) => exact == key,
      Self::Pattern(pattern) => pattern.is_match(key),
    }
  }
}

impl From<&str> for Selector {
  fn from(s: &str) -> Self {
    if s == Self::ALL_MARKER {
      Self::All
    } else {
      Self::Exact(s.to_string())
    }
  }
}

impl From<String> for Selector {
  fn from(s: String) -> Self {
    Self::from(s.as_str())
  }
}

impl From<&CacheKey> for Selector {
  fn from(key: &CacheKey) -> Self {
    Self::Exact(key.0.clone())
  }
}

impl From<Regex> for Selector {
  fn from(pattern: Regex) -> Self {
    Self::Pattern(pattern)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use serde_json::json;
  use std::collections::HashMap;

  #[test]
  fn test_key_without_params_is_base() {
    assert_eq!(CacheKey::builder("products").build().as_str(), "products");
    assert_eq!(
      CacheKey::with_params("products", &Value::Null)
        .unwrap()
        .as_str(),
      "products"
    );
  }

  #[test]
  fn test_builder_sorts_params() {
    let key = CacheKey::builder("orders")
      .param("page", 2)
      .param("customer", "acme")
      .build();
    assert_eq!(key.as_str(), r#"orders:{"customer":"acme","page":2}"#);
  }

  #[test]
  fn test_with_params_sorts_nested_objects() {
    let a = CacheKey::with_params("prices", &json!({"z": {"b": 1, "a": 2}, "y": [3, 1]})).unwrap();
    let b = CacheKey::with_params("prices", &json!({"y": [3, 1], "z": {"a": 2, "b": 1}})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), r#"prices:{"y":[3,1],"z":{"a":2,"b":1}}"#);
  }

  #[test]
  fn test_with_params_from_hashmap() {
    let mut params = HashMap::new();
    params.insert("region", "eu");
    params.insert("category", "tools");
    let key = CacheKey::with_params("products", &params).unwrap();
    assert_eq!(
      key.as_str(),
      r#"products:{"category":"tools","region":"eu"}"#
    );
  }

  #[test]
  fn test_selector_from_marker() {
    assert!(matches!(Selector::from("*"), Selector::All));
    assert!(matches!(Selector::from("products"), Selector::Exact(_)));
  }

  #[test]
  fn test_pattern_selector() {
    let selector = Selector::from(Regex::new("^products").unwrap());
    assert!(selector.matches("products:{\"page\":1}"));
    assert!(!selector.matches("orders"));
  }

  proptest! {
    #[test]
    fn prop_param_order_does_not_change_key(
      params in proptest::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..8)
    ) {
      let forward = params
        .iter()
        .fold(CacheKey::builder("res"), |b, (k, v)| b.param(k.clone(), *v))
        .build();
      let backward = params
        .iter()
        .rev()
        .fold(CacheKey::builder("res"), |b, (k, v)| b.param(k.clone(), *v))
        .build();
      prop_assert_eq!(forward, backward);
    }
  }
}
