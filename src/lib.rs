pub mod cache;
pub mod config;
pub mod logging;

pub use cache::{CacheConfig, CacheKey, CacheService, FetchError, ReadOptions, Selector};
