//! Advisory file locking across independent processes.
//!
//! A resource `path` is locked by creating the sibling file `path.lock`.
//! The lock file records who holds it:
//!
//! ```json
//! {"pid": 4242, "sessionId": "abc", "acquiredAt": 1760000000000, "hostname": "devbox"}
//! ```
//!
//! Creation is exclusive (the payload is written to a private temp file and
//! hard-linked into place, so a lock file is never observed half-written).
//! A lock whose recorded PID is no longer alive is stale and is reclaimed by
//! the next acquirer. Removing a stale lock happens under a second exclusive
//! file, `path.lock.reclaim`, whose holder re-checks the lock before deleting
//! it; two reclaimers can therefore never both delete and re-create the same
//! lock. Nothing here is OS-enforced: the protocol only protects callers that
//! go through [`LockManager`].

pub mod probe;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{DEFAULT_LOCK_POLL_MS, DEFAULT_LOCK_TIMEOUT_MS};
use crate::error::{RalphError, Result};
pub use probe::{current_hostname, is_pid_alive, ProcessProbe, SystemProbe};

/// Suffix appended to a resource path to form its lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// Suffix of the file that serializes removal of a stale lock.
const RECLAIM_SUFFIX: &str = ".reclaim";

/// Temporary file suffix for lock payloads awaiting their hard link.
const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub acquired_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl LockInfo {
    /// Lock record for `pid`, stamped with the current time.
    #[must_use]
    pub fn new(pid: u32, session_id: Option<&str>, hostname: Option<String>) -> Self {
        Self {
            pid,
            session_id: session_id.map(str::to_string),
            acquired_at: Utc::now().timestamp_millis(),
            hostname,
        }
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockResult {
    pub acquired: bool,
    pub lock_path: PathBuf,
    /// Live holder that prevented acquisition.
    pub holder: Option<LockInfo>,
    /// I/O failure that prevented acquisition.
    pub error: Option<String>,
}

impl LockResult {
    fn acquired(lock_path: PathBuf) -> Self {
        Self {
            acquired: true,
            lock_path,
            holder: None,
            error: None,
        }
    }

    fn held(lock_path: PathBuf, holder: Option<LockInfo>) -> Self {
        Self {
            acquired: false,
            lock_path,
            holder,
            error: None,
        }
    }

    fn failed(lock_path: PathBuf, error: impl ToString) -> Self {
        Self {
            acquired: false,
            lock_path,
            holder: None,
            error: Some(error.to_string()),
        }
    }
}

/// Options for [`LockManager::acquire`] and [`LockManager::with_lock`].
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub session_id: Option<String>,
    pub timeout: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }
}

impl AcquireOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Options for [`LockManager::release`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseOptions {
    /// Delete the lock even if another process owns it.
    pub force: bool,
}

impl ReleaseOptions {
    #[must_use]
    pub fn force() -> Self {
        Self { force: true }
    }
}

enum LockRead {
    Missing,
    Held(LockInfo),
    Corrupt,
    Unreadable(std::io::Error),
}

/// Outcome of [`LockManager::remove_if_stale`].
#[derive(Debug)]
enum Reclaim {
    /// A stale lock was deleted.
    Removed,
    /// There was no lock file.
    Absent,
    /// The lock is live, or another process is reclaiming it.
    Held(Option<LockInfo>),
}

/// Returns the lock file path guarding `resource`.
///
/// # Example
///
/// ```
/// use ralph_loop::lock::lock_path_for;
/// use std::path::Path;
///
/// assert_eq!(
///     lock_path_for(Path::new(".claude/ralph-loop.local.md")),
///     Path::new(".claude/ralph-loop.local.md.lock")
/// );
/// ```
#[must_use]
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name = resource.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

fn reclaim_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_owned();
    name.push(RECLAIM_SUFFIX);
    PathBuf::from(name)
}

fn temp_path_for(lock_path: &Path, pid: u32) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = lock_path.as_os_str().to_owned();
    name.push(format!(".{pid}.{seq}{TMP_SUFFIX}"));
    PathBuf::from(name)
}

/// PID embedded in the name of a lock temp file (`<lock>.<pid>.<seq>.tmp`).
fn temp_file_owner(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(TMP_SUFFIX)?;
    let (rest, seq) = stem.rsplit_once('.')?;
    let (target, pid) = rest.rsplit_once('.')?;
    seq.parse::<u64>().ok()?;
    if !(target.ends_with(LOCK_SUFFIX) || target.ends_with(RECLAIM_SUFFIX)) {
        return None;
    }
    pid.parse().ok()
}

async fn read_lock_file(lock_path: &Path) -> LockRead {
    match fs::read_to_string(lock_path).await {
        Ok(content) => match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => LockRead::Held(info),
            Err(_) => LockRead::Corrupt,
        },
        Err(e) if e.kind() == ErrorKind::NotFound => LockRead::Missing,
        Err(e) => LockRead::Unreadable(e),
    }
}

async fn remove_lock_file(lock_path: &Path) -> std::io::Result<()> {
    match fs::remove_file(lock_path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Synchronous ownership-checked removal, for use from `Drop`.
fn remove_if_owned_blocking(lock_path: &Path, pid: u32) -> bool {
    match std::fs::read_to_string(lock_path) {
        Ok(content) => match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) if info.pid == pid => std::fs::remove_file(lock_path).is_ok(),
            _ => false,
        },
        Err(e) => e.kind() == ErrorKind::NotFound,
    }
}

/// Acquires and releases advisory locks on behalf of one process.
#[derive(Debug, Clone)]
pub struct LockManager {
    pid: u32,
    hostname: Option<String>,
    probe: Arc<dyn ProcessProbe>,
    poll_interval: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Lock manager for the current process, probing liveness via the OS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            hostname: current_hostname(),
            probe: Arc::new(SystemProbe),
            poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
        }
    }

    /// Act as a different process. Used to simulate competing lockers.
    #[must_use]
    pub fn with_identity(mut self, pid: u32, hostname: Option<String>) -> Self {
        self.pid = pid;
        self.hostname = hostname;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: impl ProcessProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// PID written into lock files created by this manager.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process recorded in `info` still holds its lock.
    ///
    /// A holder on another host cannot be probed from here and is always
    /// treated as alive.
    pub fn holder_alive(&self, info: &LockInfo) -> bool {
        if let (Some(theirs), Some(ours)) = (info.hostname.as_deref(), self.hostname.as_deref()) {
            if theirs != ours {
                return true;
            }
        }
        self.probe.is_alive(info.pid)
    }

    async fn create_exclusive(&self, lock_path: &Path, info: &LockInfo) -> std::io::Result<()> {
        let payload = serde_json::to_vec(info).map_err(std::io::Error::other)?;
        let tmp_path = temp_path_for(lock_path, self.pid);
        fs::write(&tmp_path, &payload).await?;

        let linked = fs::hard_link(&tmp_path, lock_path).await;
        let _ = fs::remove_file(&tmp_path).await;

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
            Err(e) => {
                debug!("Hard link unavailable ({}), using create_new", e);
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(lock_path)
                    .await?;
                file.write_all(&payload).await?;
                file.sync_all().await?;
                Ok(())
            }
        }
    }

    /// Single non-blocking acquisition attempt.
    ///
    /// If the lock exists and its holder is dead (or the file is
    /// unparsable), the stale lock is removed and creation is retried once.
    /// While another process is reclaiming the same lock the attempt fails
    /// without waiting.
    pub async fn try_acquire(&self, resource: &Path, session_id: Option<&str>) -> LockResult {
        let lock_path = lock_path_for(resource);

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent).await {
                return LockResult::failed(lock_path, e);
            }
        }

        let info = LockInfo::new(self.pid, session_id, self.hostname.clone());

        match self.create_exclusive(&lock_path, &info).await {
            Ok(()) => {
                debug!(pid = self.pid, lock = %lock_path.display(), "Lock acquired");
                return LockResult::acquired(lock_path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return LockResult::failed(lock_path, e),
        }

        match read_lock_file(&lock_path).await {
            LockRead::Held(existing) if self.holder_alive(&existing) => {
                return LockResult::held(lock_path, Some(existing));
            }
            LockRead::Unreadable(e) => return LockResult::failed(lock_path, e),
            LockRead::Held(_) | LockRead::Corrupt | LockRead::Missing => {}
        }

        match self.remove_if_stale(&lock_path).await {
            Ok(Reclaim::Removed | Reclaim::Absent) => {}
            Ok(Reclaim::Held(holder)) => return LockResult::held(lock_path, holder),
            Err(e) => return LockResult::failed(lock_path, e),
        }

        match self.create_exclusive(&lock_path, &info).await {
            Ok(()) => {
                debug!(pid = self.pid, lock = %lock_path.display(), "Lock reclaimed");
                LockResult::acquired(lock_path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another process won the race for the reclaimed lock.
                let holder = match read_lock_file(&lock_path).await {
                    LockRead::Held(info) => Some(info),
                    _ => None,
                };
                LockResult::held(lock_path, holder)
            }
            Err(e) => LockResult::failed(lock_path, e),
        }
    }

    /// Delete `lock_path` if its holder is dead or its content unparsable.
    ///
    /// The check and the delete both happen while holding the reclaim file,
    /// so a lock created by a concurrent winner is never mistaken for the
    /// stale one it replaced.
    async fn remove_if_stale(&self, lock_path: &Path) -> std::io::Result<Reclaim> {
        let reclaim_path = reclaim_path_for(lock_path);
        if !self.enter_reclaim(&reclaim_path).await? {
            let holder = match read_lock_file(lock_path).await {
                LockRead::Held(info) if self.holder_alive(&info) => Some(info),
                _ => None,
            };
            return Ok(Reclaim::Held(holder));
        }

        let outcome = match read_lock_file(lock_path).await {
            LockRead::Held(existing) if self.holder_alive(&existing) => {
                Ok(Reclaim::Held(Some(existing)))
            }
            LockRead::Held(existing) => {
                debug!(old_pid = existing.pid, lock = %lock_path.display(), "Removing stale lock");
                remove_lock_file(lock_path).await.map(|()| Reclaim::Removed)
            }
            LockRead::Corrupt => {
                debug!(lock = %lock_path.display(), "Removing unparsable lock");
                remove_lock_file(lock_path).await.map(|()| Reclaim::Removed)
            }
            LockRead::Missing => Ok(Reclaim::Absent),
            LockRead::Unreadable(e) => Err(e),
        };

        if let Err(e) = remove_lock_file(&reclaim_path).await {
            warn!("Failed to remove {}: {}", reclaim_path.display(), e);
        }
        outcome
    }

    /// Take the reclaim file. Returns `false` while another live process
    /// holds it; a reclaim file left behind by a dead process is replaced.
    async fn enter_reclaim(&self, reclaim_path: &Path) -> std::io::Result<bool> {
        let info = LockInfo::new(self.pid, None, self.hostname.clone());
        for _ in 0..2 {
            match self.create_exclusive(reclaim_path, &info).await {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            match read_lock_file(reclaim_path).await {
                LockRead::Held(other) if self.holder_alive(&other) => return Ok(false),
                LockRead::Missing => {}
                LockRead::Unreadable(e) => return Err(e),
                LockRead::Held(_) | LockRead::Corrupt => {
                    debug!(path = %reclaim_path.display(), "Removing abandoned reclaim file");
                    remove_lock_file(reclaim_path).await?;
                }
            }
        }
        Ok(false)
    }

    /// Poll [`try_acquire`](Self::try_acquire) until it succeeds or the
    /// timeout elapses. On timeout the last failed result is returned and
    /// the caller decides how to degrade.
    pub async fn acquire(&self, resource: &Path, opts: &AcquireOptions) -> LockResult {
        let deadline = Instant::now() + opts.timeout;

        loop {
            let result = self.try_acquire(resource, opts.session_id.as_deref()).await;
            if result.acquired {
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    resource = %resource.display(),
                    holder = ?result.holder.as_ref().map(|h| h.pid),
                    "Lock acquisition timed out"
                );
                return result;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Acquire the lock and wrap it in a guard that releases on drop.
    pub async fn acquire_guard(&self, resource: &Path, opts: &AcquireOptions) -> Result<LockGuard> {
        let result = self.acquire(resource, opts).await;
        if !result.acquired {
            return Err(RalphError::LockTimeout {
                path: resource.to_path_buf(),
                holder_pid: result.holder.map(|h| h.pid),
            });
        }
        Ok(LockGuard {
            lock_path: result.lock_path,
            pid: self.pid,
            released: false,
        })
    }

    /// Release the lock on `resource`.
    ///
    /// Returns `true` if the lock file is gone afterwards (including when it
    /// was already absent). Without `force`, a lock owned by another PID is
    /// left in place and `false` is returned.
    pub async fn release(&self, resource: &Path, opts: ReleaseOptions) -> bool {
        let lock_path = lock_path_for(resource);

        if !opts.force {
            match read_lock_file(&lock_path).await {
                LockRead::Missing => return true,
                LockRead::Held(info) if info.pid == self.pid => {}
                LockRead::Held(info) => {
                    debug!(
                        owner = info.pid,
                        pid = self.pid,
                        lock = %lock_path.display(),
                        "Refusing to release lock owned by another process"
                    );
                    return false;
                }
                LockRead::Corrupt | LockRead::Unreadable(_) => return false,
            }
        }

        match remove_lock_file(&lock_path).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to release lock {}: {}", lock_path.display(), e);
                false
            }
        }
    }

    /// Run `f` while holding the lock on `resource`.
    ///
    /// The lock is released on every exit path, including errors returned by
    /// `f` and panics unwinding through it.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::LockTimeout`] if the lock is not acquired within
    /// `opts.timeout`, otherwise whatever `f` returns.
    pub async fn with_lock<F, Fut, T>(&self, resource: &Path, opts: &AcquireOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire_guard(resource, opts).await?;
        let outcome = f().await;
        guard.release().await;
        outcome
    }

    /// Read the current holder of `resource`'s lock, if any.
    pub async fn read_holder(&self, resource: &Path) -> Option<LockInfo> {
        match read_lock_file(&lock_path_for(resource)).await {
            LockRead::Held(info) => Some(info),
            _ => None,
        }
    }

    /// Remove every `*.lock` file in `directory` whose holder is dead or
    /// whose content is unparsable, along with reclaim and temp files left
    /// by dead processes. Returns the number of files removed.
    pub async fn cleanup_stale(&self, directory: &Path) -> Result<usize> {
        let mut entries = match fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(LOCK_SUFFIX) {
                match self.remove_if_stale(&path).await {
                    Ok(Reclaim::Removed) => removed += 1,
                    Ok(Reclaim::Absent | Reclaim::Held(_)) => {}
                    Err(e) => warn!("Failed to remove stale lock {}: {}", path.display(), e),
                }
            } else if name.ends_with(RECLAIM_SUFFIX) {
                let abandoned = match read_lock_file(&path).await {
                    LockRead::Held(info) => !self.holder_alive(&info),
                    LockRead::Corrupt => true,
                    LockRead::Missing | LockRead::Unreadable(_) => false,
                };
                if abandoned && remove_orphan(&path).await {
                    removed += 1;
                }
            } else if let Some(pid) = temp_file_owner(&name) {
                if !self.probe.is_alive(pid) && remove_orphan(&path).await {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

async fn remove_orphan(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed orphaned lock file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

/// A held lock. Dropping the guard releases the lock if this process still
/// owns it.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    pid: u32,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Release explicitly. Returns `false` if the lock was taken over by
    /// another process in the meantime.
    pub async fn release(mut self) -> bool {
        self.released = true;
        match read_lock_file(&self.lock_path).await {
            LockRead::Held(info) if info.pid == self.pid => {
                remove_lock_file(&self.lock_path).await.is_ok()
            }
            LockRead::Missing => true,
            _ => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            remove_if_owned_blocking(&self.lock_path, self.pid);
        }
    }
}
