//! Cross-process refresh locks
//!
//! A lock is identified by a short name derived from the cache directory,
//! bucket and key id, so every process using the same cache file contends for
//! the same lock. Factories only offer a non-blocking attempt; waiting,
//! timeouts and cancellation are handled by the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Hex characters of the SHA-256 digest kept in a lock name
const LOCK_HASH_HEX_CHARS: usize = 32;

/// A held lock. Dropping it releases the lock.
pub trait RefreshLock: Send {}

/// Creates named cross-process locks
pub trait RefreshLockFactory: Send + Sync {
    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(None)` when another holder has it.
    fn try_acquire(&self, name: &str) -> io::Result<Option<Box<dyn RefreshLock>>>;
}

/// `{prefix}{first 32 hex chars of sha256("scope::bucket::keyId")}`
pub fn lock_name(prefix: &str, scope: &str, bucket: &str, key_id: &str) -> String {
    let digest = Sha256::digest(format!("{}::{}::{}", scope, bucket, key_id).as_bytes());
    let hash = hex::encode(digest);
    format!("{}{}", prefix, &hash[..LOCK_HASH_HEX_CHARS])
}

fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", name))
}

/// Advisory `flock(2)` locks on files in a lock directory
#[cfg(unix)]
pub struct FlockLockFactory {
    dir: PathBuf,
}

#[cfg(unix)]
struct FlockGuard {
    _lock: nix::fcntl::Flock<File>,
}

#[cfg(unix)]
impl RefreshLock for FlockGuard {}

#[cfg(unix)]
impl FlockLockFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[cfg(unix)]
impl RefreshLockFactory for FlockLockFactory {
    fn try_acquire(&self, name: &str) -> io::Result<Option<Box<dyn RefreshLock>>> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        fs::create_dir_all(&self.dir)?;
        let path = lock_path(&self.dir, name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        // The lock file itself is never removed; the kernel drops the lock with the fd
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(lock = name, "Acquired flock refresh lock");
                Ok(Some(Box::new(FlockGuard { _lock: lock })))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(io::Error::from(errno)),
        }
    }
}

/// Lock files created with `O_EXCL`; works on every platform.
///
/// A crashed holder leaves its file behind, so files older than `stale_after`
/// are taken over.
pub struct CreateNewLockFactory {
    dir: PathBuf,
    stale_after: Duration,
}

struct LockFile {
    path: PathBuf,
}

impl RefreshLock for LockFile {}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock file");
        }
    }
}

impl CreateNewLockFactory {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    fn create(&self, path: &Path) -> io::Result<Option<Box<dyn RefreshLock>>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                // Holder pid, for humans inspecting the directory
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Box::new(LockFile {
                    path: path.to_path_buf(),
                })))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_stale(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_after)
    }
}

impl RefreshLockFactory for CreateNewLockFactory {
    fn try_acquire(&self, name: &str) -> io::Result<Option<Box<dyn RefreshLock>>> {
        fs::create_dir_all(&self.dir)?;
        let path = lock_path(&self.dir, name);

        if let Some(lock) = self.create(&path)? {
            return Ok(Some(lock));
        }
        if self.is_stale(&path) {
            warn!(path = %path.display(), "Taking over abandoned lock file");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            return self.create(&path);
        }
        Ok(None)
    }
}
