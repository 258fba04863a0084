//! Cache configuration
//!
//! Option structs for the three cache components. Every struct has sensible
//! defaults and can be deserialized from an application's own config file.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Default interval between expiration sweeps: 5 minutes
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Default idle time before the LRU worker exits: 2 minutes
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default sleep between polls of an empty event queue
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(50);

/// Safety margin subtracted from expirations
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(300);

/// Default cross-process lock timeout
const DEFAULT_REFRESH_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default sleep between attempts on the cross-process lock
const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default file name template for the secure file cache
pub const DEFAULT_FILE_NAME_TEMPLATE: &str = "{bucket}_{keyId}.bin";

/// Options for [`crate::lru::LruCache`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LruOptions {
    /// Capacity used to decide when to compact
    pub capacity: usize,
    /// Keep items in least-recently-used order (otherwise compaction removes arbitrary items)
    pub maintain_lru: bool,
    /// Reject already-expired values and sweep expired values periodically
    pub remove_expired_values: bool,
    /// Interval between expiration sweeps
    #[serde(with = "duration_secs")]
    pub expired_sweep_interval: Duration,
    /// Idle time after which the background worker exits
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Sleep between polls when the event queue is empty
    #[serde(with = "duration_millis")]
    pub polling_interval: Duration,
    /// Share of entries removed by one compaction
    pub compaction_percentage: f64,
    /// Occupancy ratio that triggers compaction
    pub max_capacity_percentage: f64,
}

impl Default for LruOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            maintain_lru: true,
            remove_expired_values: false,
            expired_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            compaction_percentage: 0.20,
            max_capacity_percentage: 0.95,
        }
    }
}

impl LruOptions {
    /// Options with the given capacity and all other values defaulted
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

/// Options for [`crate::filecache::SecureFileCache`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileCacheOptions {
    /// Directory holding cache files (None resolves the per-OS default)
    pub base_directory: Option<PathBuf>,
    /// File name template; must contain `{bucket}` and `{keyId}`
    pub file_name_template: String,
    /// Safety margin before `expires_on`
    #[serde(with = "duration_secs")]
    pub expiry_skew: Duration,
    /// How long to wait for the cross-process refresh lock
    #[serde(with = "duration_secs")]
    pub refresh_lock_timeout: Duration,
    /// Sleep between non-blocking lock attempts
    #[serde(with = "duration_millis")]
    pub lock_poll_interval: Duration,
}

impl Default for FileCacheOptions {
    fn default() -> Self {
        Self {
            base_directory: None,
            file_name_template: DEFAULT_FILE_NAME_TEMPLATE.to_string(),
            expiry_skew: DEFAULT_EXPIRY_SKEW,
            refresh_lock_timeout: DEFAULT_REFRESH_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

impl FileCacheOptions {
    /// Defaults overridden by `CREDCACHE_DIR`, `CREDCACHE_LOCK_TIMEOUT_SECS`
    /// and `CREDCACHE_EXPIRY_SKEW_SECS`
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(dir) = env::var("CREDCACHE_DIR") {
            if !dir.is_empty() {
                options.base_directory = Some(PathBuf::from(dir));
            }
        }
        if let Some(secs) = env_secs("CREDCACHE_LOCK_TIMEOUT_SECS") {
            options.refresh_lock_timeout = secs;
        }
        if let Some(secs) = env_secs("CREDCACHE_EXPIRY_SKEW_SECS") {
            options.expiry_skew = secs;
        }

        options
    }

    /// Options rooted at an explicit directory
    pub fn in_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: Some(dir.into()),
            ..Self::default()
        }
    }
}

/// Options for [`crate::token::TokenCache`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenCacheOptions {
    /// Client id of the application owning the cache
    pub client_id: String,
    /// Maximum number of partitions kept in memory
    pub max_partitions: usize,
    /// Family-of-client-ids refresh tokens are honoured
    pub foci_enabled: bool,
    /// Serve tokens past `expires_on` but before `extended_expires_on`
    pub extended_lifetime_enabled: bool,
    /// Safety margin before `expires_on`
    #[serde(with = "duration_secs")]
    pub expiry_skew: Duration,
}

impl Default for TokenCacheOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            max_partitions: 10_000,
            foci_enabled: true,
            extended_lifetime_enabled: false,
            expiry_skew: DEFAULT_EXPIRY_SKEW,
        }
    }
}

impl TokenCacheOptions {
    pub fn for_client(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "Ignoring invalid duration override");
            None
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
