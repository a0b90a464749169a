//! Cross-process, cross-thread mutual exclusion and atomic publish-by-rename
//! for cache directories.
//!
//! Every mutating region of the on-disk cache is guarded by a lock scoped to
//! that specific sub-path, never a global lock, so unrelated cache entries do
//! not serialize against each other.

mod atomic;
mod lock;

pub use atomic::{atomic_directory, AtomicDirectory};
pub use lock::{FileLock, LockStyle};

/// Cache-layer failures that callers can match on.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache path {0} has no parent directory to anchor a work dir")]
    NoParent(std::path::PathBuf),
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("cache I/O failure at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}
