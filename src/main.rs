use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use hoard::cache::{Clock, SystemClock};
use hoard::config::Config;
use hoard::{logging, CacheService, ReadOptions, Selector};
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "hoard")]
#[command(about = "Inspect and edit a persisted hoard cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hoard/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache namespace to operate on
  #[arg(short, long)]
  namespace: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cached entries
  List,
  /// Print the value cached under a key
  Get {
    key: String,
    /// Return the entry even if it has expired
    #[arg(long)]
    stale: bool,
  },
  /// Cache a JSON value under a key
  Set {
    key: String,
    value: String,
    /// Time to live in milliseconds (default: cache.default_ttl_secs)
    #[arg(long)]
    ttl_ms: Option<u64>,
  },
  /// Remove one key, every key matching a pattern, or everything
  #[command(group(ArgGroup::new("target").required(true).args(["key", "all", "pattern"])))]
  Invalidate {
    key: Option<String>,
    #[arg(long)]
    all: bool,
    /// Regular expression matched against keys
    #[arg(long)]
    pattern: Option<String>,
  },
  /// Remove expired entries now
  Sweep,
  /// Remove every entry
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(namespace) = args.namespace {
    config.cache.namespace = namespace;
  }

  let _log_guard = logging::init(&config.log)?;

  let path = config.database_path()?;
  let mut backing = hoard::cache::SqliteBacking::open(&path, &config.cache.namespace)?;
  if let Some(bytes) = config.cache.capacity_bytes {
    backing = backing.with_capacity(bytes);
  }
  let cache = CacheService::<Value>::new(backing, config.cache_config());

  let result = run(&cache, &config, args.command);
  // Persist whatever the command changed, even if it failed part way
  cache.flush().await;
  result
}

fn run(cache: &CacheService<Value>, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::List => {
      let now = SystemClock.now_ms();
      for entry in cache.entries() {
        let ttl = entry
          .ttl
          .map_or_else(|| "-".to_string(), |ttl| format!("{}ms", ttl));
        let state = if entry.is_expired(now) { "expired" } else { "fresh" };
        println!(
          "{}\tage={}ms\tttl={}\t{}",
          entry.key,
          entry.age_ms(now),
          ttl,
          state
        );
      }
    }
    Command::Get { key, stale } => {
      let options = if stale {
        ReadOptions::skip_expiry()
      } else {
        ReadOptions::default()
      };
      let cached = cache
        .get_cached(&key, options)
        .ok_or_else(|| eyre!("No cached entry for {}", key))?;
      let age_ms = cached.age_ms();
      let out = json!({
        "data": cached.data,
        "age_ms": age_ms,
        "expired": cached.is_expired,
      });
      println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Command::Set { key, value, ttl_ms } => {
      let data: Value =
        serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
      let ttl = ttl_ms.map(Duration::from_millis).or_else(|| config.default_ttl());
      if !cache.set_cached(&key, data, ttl) {
        return Err(eyre!("System clock is before the Unix epoch, {} was not cached", key));
      }
    }
    Command::Invalidate { key, all, pattern } => {
      let selector = if all {
        Selector::All
      } else if let Some(pattern) = pattern {
        let regex =
          Regex::new(&pattern).map_err(|e| eyre!("Invalid pattern {:?}: {}", pattern, e))?;
        Selector::Pattern(regex)
      } else if let Some(key) = key {
        Selector::Exact(key)
      } else {
        return Err(eyre!("Nothing to invalidate"));
      };
      println!("Removed {} entries", cache.invalidate(selector));
    }
    Command::Sweep => {
      println!("Removed {} expired entries", cache.sweep_now());
    }
    Command::Clear => {
      let count = cache.len();
      cache.teardown();
      println!("Removed {} entries", count);
    }
  }
  Ok(())
}
