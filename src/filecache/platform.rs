//! Per-OS capabilities of the file cache
//!
//! The platform is picked once at startup from the running OS and decides the
//! default cache directory and how cross-process locks are taken.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::lock::{CreateNewLockFactory, RefreshLockFactory};

/// Lock files older than this belong to a crashed process
const STALE_LOCK_AGE: Duration = Duration::from_secs(10 * 60);

/// Directory (under the cache directory) holding lock files
const LOCK_DIR_NAME: &str = ".locks";

/// What differs between operating systems
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Per-user directory used when no base directory is configured
    fn default_base_directory(&self) -> Option<PathBuf>;

    /// Prefix of cross-process lock names
    fn lock_name_prefix(&self) -> &'static str;

    /// Lock factory for a cache rooted at `base_directory`
    fn lock_factory(&self, base_directory: &Path) -> Arc<dyn RefreshLockFactory>;
}

/// `%LOCALAPPDATA%\Microsoft\Identity\FileCache`, lock files
pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn default_base_directory(&self) -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("Microsoft").join("Identity").join("FileCache"))
    }

    fn lock_name_prefix(&self) -> &'static str {
        "Global-credcache-"
    }

    fn lock_factory(&self, base_directory: &Path) -> Arc<dyn RefreshLockFactory> {
        Arc::new(CreateNewLockFactory::new(
            base_directory.join(LOCK_DIR_NAME),
            STALE_LOCK_AGE,
        ))
    }
}

/// `~/.msal/filecache`, `flock(2)` where available
pub struct UnixPlatform;

impl Platform for UnixPlatform {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn default_base_directory(&self) -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".msal").join("filecache"))
    }

    fn lock_name_prefix(&self) -> &'static str {
        "credcache-"
    }

    #[cfg(unix)]
    fn lock_factory(&self, base_directory: &Path) -> Arc<dyn RefreshLockFactory> {
        Arc::new(super::lock::FlockLockFactory::new(base_directory.join(LOCK_DIR_NAME)))
    }

    #[cfg(not(unix))]
    fn lock_factory(&self, base_directory: &Path) -> Arc<dyn RefreshLockFactory> {
        Arc::new(CreateNewLockFactory::new(
            base_directory.join(LOCK_DIR_NAME),
            STALE_LOCK_AGE,
        ))
    }
}

/// Platform of the running OS
pub fn current_platform() -> Arc<dyn Platform> {
    match std::env::consts::OS {
        "windows" => Arc::new(WindowsPlatform),
        _ => Arc::new(UnixPlatform),
    }
}
