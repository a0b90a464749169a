use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs4::FileExt;
use once_cell::sync::Lazy;

use crate::CacheError;

/// OS advisory lock flavor.
///
/// POSIX `fcntl` byte-range locks are owned by the process, not the file
/// descriptor: a second thread of the same process re-acquiring one can
/// self-deadlock (or silently succeed) depending on platform. BSD `flock`
/// locks are per-descriptor and safe to take from a thread pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockStyle {
    Posix,
    #[default]
    Bsd,
}

/// One `Mutex` per lock path, shared process-wide. Threads of this process
/// serialize here before ever touching the OS lock, which keeps the POSIX
/// style usable from multiple threads. Entries are leaked; the set of lock
/// paths a run touches is small and bounded by the cache layout.
static PROCESS_LOCKS: Lazy<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn process_mutex(path: &Path) -> &'static Mutex<()> {
    let mut registry = PROCESS_LOCKS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    registry
        .entry(path.to_path_buf())
        .or_insert_with(|| Box::leak(Box::new(Mutex::new(()))))
}

/// An exclusive advisory lock on a file path, held until dropped.
///
/// The OS-level lock provides cross-process exclusion; the in-process mutex
/// underneath it provides cross-thread exclusion within one process.
pub struct FileLock {
    path: PathBuf,
    file: File,
    style: LockStyle,
    _process_guard: MutexGuard<'static, ()>,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is granted.
    ///
    /// The wait is unbounded; advisory locks release on process exit, so a
    /// crashed holder cannot wedge waiters forever.
    pub fn acquire(path: &Path, style: LockStyle) -> Result<Self, CacheError> {
        let process_guard = process_mutex(path)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| CacheError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        os_lock(&file, style).map_err(|source| CacheError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            style,
            _process_guard: process_guard,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn style(&self) -> LockStyle {
        self.style
    }

    /// Release the lock. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = os_unlock(&self.file, self.style) {
            tracing::warn!(path = %self.path.display(), "failed to unlock: {err}");
        }
    }
}

#[cfg(unix)]
fn os_lock(file: &File, style: LockStyle) -> std::io::Result<()> {
    match style {
        LockStyle::Bsd => file.lock_exclusive(),
        LockStyle::Posix => posix_fcntl(file, libc::F_WRLCK as libc::c_short),
    }
}

#[cfg(unix)]
fn os_unlock(file: &File, style: LockStyle) -> std::io::Result<()> {
    match style {
        LockStyle::Bsd => file.unlock(),
        LockStyle::Posix => posix_fcntl(file, libc::F_UNLCK as libc::c_short),
    }
}

/// Whole-file `fcntl` lock, blocking via `F_SETLKW`.
#[cfg(unix)]
fn posix_fcntl(file: &File, kind: libc::c_short) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

// Windows has no fcntl; both styles share the whole-file lock.
#[cfg(not(unix))]
fn os_lock(file: &File, _style: LockStyle) -> std::io::Result<()> {
    file.lock_exclusive()
}

#[cfg(not(unix))]
fn os_unlock(file: &File, _style: LockStyle) -> std::io::Result<()> {
    file.unlock()
}
