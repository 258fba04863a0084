//! Client-side credential cache
//!
//! - [`lru`]: bounded concurrent LRU cache whose ordering is maintained by a
//!   single background worker
//! - [`token`]: token cache, matching engine and per-request sessions
//! - [`filecache`]: durable cross-process cache for secret material
//! - [`registry`]: explicit owner of the caches an application shares

pub mod config;
pub mod error;
pub mod filecache;
pub mod lru;
pub mod registry;
pub mod token;

pub use config::{FileCacheOptions, LruOptions, TokenCacheOptions};
pub use error::{CacheError, Result};
pub use filecache::{CacheValue, SecureFileCache};
pub use lru::LruCache;
pub use registry::CacheRegistry;
pub use token::{CacheSessionManager, TokenCache, TokenCacheNotifications};
