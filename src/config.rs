use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheConfig, SqliteBacking};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub cache: CacheSettings,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
  /// Prefix separating this cache's keys from other state in the same database
  pub namespace: String,
  /// Database file (defaults to $XDG_DATA_HOME/hoard/cache.db)
  pub path: Option<PathBuf>,
  /// Upper bound on the bytes of stored values, unbounded if unset
  pub capacity_bytes: Option<u64>,
  /// Seconds between expiration sweeps; 0 disables the sweeper
  pub sweep_interval_secs: u64,
  /// TTL applied by the CLI `set` command when none is given
  pub default_ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      namespace: "hoard".to_string(),
      path: None,
      capacity_bytes: None,
      sweep_interval_secs: 60,
      default_ttl_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive, e.g. "info" or "hoard=debug" (RUST_LOG wins if set)
  pub level: String,
  /// Log to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hoard.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hoard/config.yaml
  ///
  /// Without a config file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hoard.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hoard").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Runtime settings for the cache service.
  pub fn cache_config(&self) -> CacheConfig {
    match self.cache.sweep_interval_secs {
      0 => CacheConfig::default().without_sweeper(),
      secs => CacheConfig::default().with_sweep_interval(Duration::from_secs(secs)),
    }
  }

  /// Where the cache database lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => SqliteBacking::default_path(),
    }
  }

  pub fn default_ttl(&self) -> Option<Duration> {
    self.cache.default_ttl_secs.map(Duration::from_secs)
  }
}
