//! Secure File Cache
//!
//! Durable cache of opaque payloads keyed by (bucket, key id). Writes are
//! atomic (temp file, fsync, rename) and `get_or_create` makes sure only one
//! caller across all processes runs the refresh factory for a key.

use std::fs::{self, File};
use std::future::Future;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use moka::sync::Cache;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::Envelope;
use super::lock::{lock_name, RefreshLock, RefreshLockFactory};
use super::platform::{current_platform, Platform};
use crate::config::{FileCacheOptions, DEFAULT_FILE_NAME_TEMPLATE};
use crate::error::{CacheError, Result};
use crate::token::items::unix_now;

/// Suffix of in-flight temp files
const TEMP_SUFFIX: &str = ".tmp";

/// Temp files older than this are leftovers of interrupted writes
const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Idle time after which an in-process gate is dropped
const GATE_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Moves a finished temp file over the destination
type PersistFn = fn(NamedTempFile, &Path) -> io::Result<()>;

fn persist_replace(tmp: NamedTempFile, path: &Path) -> io::Result<()> {
    // On failure the temp file comes back inside the error and is deleted on drop
    tmp.persist(path).map(|_| ()).map_err(|e| e.error)
}

/// A payload with its freshness times (unix seconds)
#[derive(Clone, PartialEq, Eq)]
pub struct CacheValue {
    pub payload: Vec<u8>,
    pub expires_on: i64,
    pub refresh_on: Option<i64>,
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheValue")
            .field("payload_len", &self.payload.len())
            .field("expires_on", &self.expires_on)
            .field("refresh_on", &self.refresh_on)
            .finish()
    }
}

impl CacheValue {
    pub fn new(payload: Vec<u8>, expires_on: i64, refresh_on: Option<i64>) -> Self {
        Self {
            payload,
            expires_on,
            refresh_on,
        }
    }

    /// Value expiring `ttl` from now, without a refresh time
    pub fn expiring_in(payload: Vec<u8>, ttl: Duration) -> Self {
        Self::new(payload, unix_now() + ttl.as_secs() as i64, None)
    }

    /// Ask readers to refresh `refresh_in` from now
    pub fn refresh_in(mut self, refresh_in: Duration) -> Self {
        self.refresh_on = Some(unix_now() + refresh_in.as_secs() as i64);
        self
    }
}

/// What is on disk for a key right now
struct ReadState {
    envelope: Envelope,
    expired: bool,
    needs_refresh: bool,
}

impl ReadState {
    fn is_fresh(&self) -> bool {
        !self.expired && !self.needs_refresh
    }
}

/// Replace everything but letters and digits with `-`
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|ch| if ch.is_alphanumeric() { ch } else { '-' })
        .collect()
}

/// File-backed cache with per-key single-flight refresh
pub struct SecureFileCache {
    base_directory: PathBuf,
    file_name_template: String,
    expiry_skew: Duration,
    refresh_lock_timeout: Duration,
    lock_poll_interval: Duration,
    platform: Arc<dyn Platform>,
    lock_factory: Arc<dyn RefreshLockFactory>,
    /// One gate per (bucket, key id) to dedupe callers inside this process
    gates: Cache<String, Arc<Mutex<()>>>,
    persist: PersistFn,
}

impl SecureFileCache {
    /// Create a cache for the running platform
    pub fn new(options: FileCacheOptions) -> Result<Self> {
        Self::with_platform(options, current_platform())
    }

    /// Create a cache with an explicit platform
    ///
    /// # Arguments
    /// * `options` - Directory, file name template, skew and lock timeouts
    /// * `platform` - Supplies the default directory and the lock factory
    pub fn with_platform(options: FileCacheOptions, platform: Arc<dyn Platform>) -> Result<Self> {
        let base_directory = match options.base_directory {
            Some(dir) => dir,
            None => platform.default_base_directory().ok_or_else(|| {
                CacheError::InvalidArgument(
                    "no per-user directory found; configure base_directory".to_string(),
                )
            })?,
        };

        let file_name_template = if options.file_name_template.is_empty() {
            DEFAULT_FILE_NAME_TEMPLATE.to_string()
        } else {
            options.file_name_template
        };
        if !file_name_template.contains("{bucket}") || !file_name_template.contains("{keyId}") {
            return Err(CacheError::InvalidArgument(format!(
                "file name template {:?} must contain {{bucket}} and {{keyId}}",
                file_name_template
            )));
        }

        fs::create_dir_all(&base_directory)?;

        let cache = Self {
            lock_factory: platform.lock_factory(&base_directory),
            base_directory,
            file_name_template,
            expiry_skew: options.expiry_skew,
            refresh_lock_timeout: options.refresh_lock_timeout,
            lock_poll_interval: options.lock_poll_interval,
            platform,
            gates: Cache::builder()
                .time_to_idle(GATE_IDLE_TIMEOUT)
                .name("file_cache_gates")
                .build(),
            persist: persist_replace,
        };

        cache.cleanup(STALE_TEMP_AGE);

        info!(
            base_directory = %cache.base_directory.display(),
            platform = cache.platform.name(),
            "Secure file cache initialized"
        );

        Ok(cache)
    }

    /// Replace the cross-process lock implementation
    pub fn with_lock_factory(mut self, lock_factory: Arc<dyn RefreshLockFactory>) -> Self {
        self.lock_factory = lock_factory;
        self
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// File holding the entry for (bucket, key id)
    pub fn path_for(&self, bucket: &str, key_id: &str) -> PathBuf {
        let file_name = self
            .file_name_template
            .replace("{bucket}", &sanitize(bucket))
            .replace("{keyId}", &sanitize(key_id));
        self.base_directory.join(file_name)
    }

    fn skew_secs(&self) -> i64 {
        self.expiry_skew.as_secs() as i64
    }

    fn read_state(&self, path: &Path) -> Option<ReadState> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Unreadable cache file treated as miss");
                return None;
            }
        };

        let Some(envelope) = Envelope::decode(&data) else {
            debug!(path = %path.display(), size = data.len(), "Corrupt cache file treated as miss");
            return None;
        };

        let now = unix_now();
        let skew = self.skew_secs();
        let expired = envelope.is_expired(now, skew);
        let needs_refresh = !expired && envelope.is_past_refresh(now, skew);
        Some(ReadState {
            envelope,
            expired,
            needs_refresh,
        })
    }

    /// Read a payload that has not expired; a refresh-due payload is still returned
    pub fn try_read(&self, bucket: &str, key_id: &str) -> Option<Vec<u8>> {
        let state = self.read_state(&self.path_for(bucket, key_id))?;
        if state.expired {
            debug!(bucket = bucket, "File cache entry expired");
            return None;
        }
        Some(state.envelope.payload)
    }

    /// Write (or overwrite) an entry atomically
    pub fn write(&self, bucket: &str, key_id: &str, value: &CacheValue) -> Result<()> {
        let path = self.path_for(bucket, key_id);
        fs::create_dir_all(&self.base_directory)?;

        let bytes = Envelope::new(value.payload.clone(), value.expires_on, value.refresh_on).encode();
        let prefix = path
            .file_name()
            .map(|name| format!("{}.", name.to_string_lossy()))
            .unwrap_or_default();

        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.base_directory)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;

        (self.persist)(tmp, &path)?;

        if let Ok(dir) = File::open(&self.base_directory) {
            let _ = dir.sync_all();
        }

        debug!(
            bucket = bucket,
            path = %path.display(),
            size = bytes.len(),
            expires_on = value.expires_on,
            "Stored entry in file cache"
        );
        Ok(())
    }

    /// Delete an entry; returns whether it existed
    pub fn remove(&self, bucket: &str, key_id: &str) -> Result<bool> {
        let path = self.path_for(bucket, key_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed file cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove temp files left by interrupted writes; returns how many were removed
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let Ok(read_dir) = fs::read_dir(&self.base_directory) else {
            return 0;
        };

        let mut removed = 0;
        for entry in read_dir.flatten() {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with(TEMP_SUFFIX));
            if !is_temp {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .map_or(true, |age| age >= older_than);
            if old_enough {
                debug!(path = %path.display(), "Removing stale temp file");
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Return a fresh payload, running `factory` at most once across callers.
    ///
    /// The file is checked three times: without any lock, after the
    /// in-process gate and after the cross-process lock. If the factory fails
    /// while a refresh-due but unexpired copy exists, that copy is returned.
    pub async fn get_or_create<F, Fut>(
        &self,
        bucket: &str,
        key_id: &str,
        cancellation: &CancellationToken,
        factory: F,
    ) -> Result<Vec<u8>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<CacheValue>>,
    {
        let path = self.path_for(bucket, key_id);
        // Gates and locks are keyed like the file name
        let (file_bucket, file_key) = (sanitize(bucket), sanitize(key_id));

        if let Some(state) = self.read_state(&path).filter(ReadState::is_fresh) {
            debug!(bucket = bucket, "File cache HIT");
            return Ok(state.envelope.payload);
        }

        let gate = self
            .gates
            .get_with(format!("{}|{}", file_bucket, file_key), || Arc::new(Mutex::new(())));
        let _gate_guard = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(CacheError::Cancelled),
            guard = gate.lock() => guard,
        };

        let state = self.read_state(&path);
        if let Some(state) = state.as_ref().filter(|s| s.is_fresh()) {
            debug!(bucket = bucket, "File cache HIT after in-process wait");
            return Ok(state.envelope.payload.clone());
        }

        let name = lock_name(
            self.platform.lock_name_prefix(),
            &self.base_directory.to_string_lossy(),
            &file_bucket,
            &file_key,
        );
        // Declared after the gate guard so it is released first
        let Some(_refresh_lock) = self.acquire_refresh_lock(&name, cancellation).await? else {
            if let Some(state) = state.filter(|s| !s.expired) {
                warn!(bucket = bucket, "Refresh lock timed out; serving cached value");
                return Ok(state.envelope.payload);
            }
            return Err(CacheError::LockTimeout {
                bucket: bucket.to_string(),
                key_id: key_id.to_string(),
            });
        };

        let state = self.read_state(&path);
        if let Some(state) = state.as_ref().filter(|s| s.is_fresh()) {
            debug!(bucket = bucket, "File cache refreshed by another process");
            return Ok(state.envelope.payload.clone());
        }

        debug!(bucket = bucket, "File cache MISS, running factory");
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(CacheError::Cancelled),
            result = factory(cancellation.clone()) => result,
        };

        match result {
            Ok(value) => {
                self.write(bucket, key_id, &value)?;
                Ok(value.payload)
            }
            Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
            Err(e) => match state.filter(|s| !s.expired) {
                Some(state) => {
                    warn!(bucket = bucket, error = %e, "Refresh failed; serving cached value");
                    Ok(state.envelope.payload)
                }
                None => Err(e),
            },
        }
    }

    /// Poll the cross-process lock until acquired, timed out (`None`) or cancelled
    async fn acquire_refresh_lock(
        &self,
        name: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<Box<dyn RefreshLock>>> {
        let deadline = Instant::now() + self.refresh_lock_timeout;
        loop {
            if let Some(lock) = self.lock_factory.try_acquire(name)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                warn!(lock = name, timeout = ?self.refresh_lock_timeout, "Refresh lock timed out");
                return Ok(None);
            }
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(CacheError::Cancelled),
                _ = tokio::time::sleep(self.lock_poll_interval) => {}
            }
        }
    }
}
