use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{CacheError, FileLock, LockStyle};

/// eCryptFS caps encrypted names at 143 bytes; longer basenames collapse to
/// a truncated prefix plus a content hash so lock and work names stay legal.
const MAX_BASENAME_BYTES: usize = 143;
const LOCK_SUFFIX: &str = ".atomic_directory.lck";
const WORK_SUFFIX: &str = ".atomic_directory.work";

/// Handle to a cache directory that is populated atomically.
///
/// The work dir is always a filesystem sibling of the target dir, so the
/// final `rename` stays on one volume and is atomic.
#[derive(Debug)]
pub struct AtomicDirectory {
    target_dir: PathBuf,
    work_dir: PathBuf,
    lock_file: PathBuf,
}

impl AtomicDirectory {
    fn new(target_dir: &Path) -> Result<Self, CacheError> {
        let parent = target_dir
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| CacheError::NoParent(target_dir.to_path_buf()))?;
        let basename = target_dir
            .file_name()
            .map(|name| collapsed_basename(&name.to_string_lossy()))
            .ok_or_else(|| CacheError::NoParent(target_dir.to_path_buf()))?;
        Ok(Self {
            target_dir: target_dir.to_path_buf(),
            work_dir: parent.join(format!(".{basename}{WORK_SUFFIX}")),
            lock_file: parent.join(format!(".{basename}{LOCK_SUFFIX}")),
        })
    }

    #[must_use]
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    #[must_use]
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// The target exists, meaning some population attempt won.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.target_dir.exists()
    }

    fn prepare_work_dir(&self) -> Result<()> {
        if self.work_dir.exists() {
            // A previous holder died between mkdir and finalize.
            warn!(
                work_dir = %self.work_dir.display(),
                "removing stale work dir left by an abnormally terminated writer"
            );
            fs::remove_dir_all(&self.work_dir).with_context(|| {
                format!("failed to clear stale work dir {}", self.work_dir.display())
            })?;
        }
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("failed to create work dir {}", self.work_dir.display()))?;
        Ok(())
    }

    /// Publish the populated work dir. A loser of the rename race treats the
    /// other writer's content as its own success.
    fn finalize(&self) -> Result<()> {
        match fs::rename(&self.work_dir, &self.target_dir) {
            Ok(()) => {
                if let Some(parent) = self.target_dir.parent() {
                    if let Ok(dir) = fs::File::open(parent) {
                        let _ = dir.sync_all();
                    }
                }
                Ok(())
            }
            Err(err) if lost_rename_race(&err) && self.target_dir.exists() => {
                debug!(
                    target_dir = %self.target_dir.display(),
                    "another writer finalized first; discarding our work dir"
                );
                Ok(())
            }
            Err(err) => Err(err).with_context(|| {
                format!(
                    "failed to rename {} into {}",
                    self.work_dir.display(),
                    self.target_dir.display()
                )
            }),
        }
    }

    fn discard_work_dir(&self) {
        if self.work_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&self.work_dir) {
                warn!(
                    work_dir = %self.work_dir.display(),
                    "failed to remove work dir: {err}"
                );
            }
        }
    }
}

/// `EEXIST`/`ENOTEMPTY` from the final rename mean a concurrent writer won.
fn lost_rename_race(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty)
        || matches!(err.raw_os_error(), Some(code) if code == not_empty_code())
}

#[cfg(unix)]
fn not_empty_code() -> i32 {
    libc::ENOTEMPTY
}

#[cfg(not(unix))]
fn not_empty_code() -> i32 {
    145 // ERROR_DIR_NOT_EMPTY
}

/// Atomically populate `target_dir` with double-checked locking.
///
/// The fast path returns a finalized handle without taking any lock. Otherwise
/// an exclusive cross-process lock is taken, existence re-checked, and only
/// then is `populate` run against a fresh sibling work dir which is renamed
/// into place on success. `populate` never runs for an already-finalized
/// directory, and a failing `populate` never creates `target_dir`.
pub fn atomic_directory(
    target_dir: &Path,
    style: LockStyle,
    populate: impl FnOnce(&Path) -> Result<()>,
) -> Result<AtomicDirectory> {
    let atomic_dir = AtomicDirectory::new(target_dir)?;
    if atomic_dir.is_finalized() {
        return Ok(atomic_dir);
    }

    let lock = FileLock::acquire(atomic_dir.lock_file(), style)?;
    // Another process may have finished while we waited on the lock.
    if atomic_dir.is_finalized() {
        lock.release();
        return Ok(atomic_dir);
    }

    atomic_dir.prepare_work_dir()?;
    let populated = populate(atomic_dir.work_dir());
    let result = match populated {
        Ok(()) => atomic_dir.finalize(),
        Err(err) => Err(err),
    };
    atomic_dir.discard_work_dir();
    lock.release();
    result?;
    Ok(atomic_dir)
}

fn collapsed_basename(basename: &str) -> String {
    if basename.len() <= MAX_BASENAME_BYTES {
        return basename.to_string();
    }
    let digest = hex::encode(Sha256::digest(basename.as_bytes()));
    // Keep a readable prefix; "..." marks the collapse.
    let keep = MAX_BASENAME_BYTES - digest.len() - 3;
    let mut prefix_end = keep;
    while !basename.is_char_boundary(prefix_end) {
        prefix_end -= 1;
    }
    format!("{}...{digest}", &basename[..prefix_end])
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn populates_then_finalizes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("entry");

        let handle = atomic_directory(&target, LockStyle::Bsd, |work_dir| {
            fs::write(work_dir.join("payload"), b"bytes")?;
            Ok(())
        })?;

        assert!(handle.is_finalized());
        assert_eq!(fs::read(target.join("payload"))?, b"bytes");
        assert!(!handle.work_dir().exists());
        Ok(())
    }

    #[test]
    fn finalized_target_skips_population() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("entry");
        fs::create_dir(&target)?;
        fs::write(target.join("original"), b"keep me")?;

        let ran = AtomicUsize::new(0);
        let handle = atomic_directory(&target, LockStyle::Bsd, |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;

        assert!(handle.is_finalized());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read(target.join("original"))?, b"keep me");
        Ok(())
    }

    #[test]
    fn failed_population_never_creates_target() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("entry");

        let result = atomic_directory(&target, LockStyle::Bsd, |work_dir| {
            fs::write(work_dir.join("partial"), b"half")?;
            anyhow::bail!("build exploded")
        });

        assert!(result.is_err());
        assert!(!target.exists());
        // The work dir must not leak either.
        assert_eq!(fs::read_dir(temp.path())?.count(), 1); // just the lock file
        Ok(())
    }

    #[test]
    fn concurrent_writers_produce_exactly_one_population() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("entry");
        let populations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for writer in 0..8 {
            let target = target.clone();
            let populations = Arc::clone(&populations);
            handles.push(std::thread::spawn(move || {
                atomic_directory(&target, LockStyle::Bsd, |work_dir| {
                    populations.fetch_add(1, Ordering::SeqCst);
                    fs::write(work_dir.join("writer"), format!("{writer}"))?;
                    Ok(())
                })
                .map(|handle| handle.is_finalized())
            }));
        }

        for handle in handles {
            assert!(handle.join().expect("writer thread")?);
        }
        assert_eq!(populations.load(Ordering::SeqCst), 1);
        assert!(target.join("writer").exists());
        Ok(())
    }

    #[test]
    fn stale_work_dir_is_recovered() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("entry");
        let stale = temp.path().join(format!(".entry{WORK_SUFFIX}"));
        fs::create_dir_all(stale.join("junk"))?;

        let handle = atomic_directory(&target, LockStyle::Bsd, |work_dir| {
            assert_eq!(fs::read_dir(work_dir)?.count(), 0);
            fs::write(work_dir.join("fresh"), b"clean")?;
            Ok(())
        })?;

        assert!(handle.is_finalized());
        assert!(!target.join("junk").exists());
        Ok(())
    }

    #[test]
    fn relative_single_component_target_is_rejected() {
        let err = AtomicDirectory::new(Path::new("entry")).unwrap_err();
        assert!(matches!(err, CacheError::NoParent(_)));
    }

    #[test]
    fn long_basenames_collapse_below_the_limit() {
        let long = "x".repeat(300);
        let collapsed = collapsed_basename(&long);
        assert!(collapsed.len() <= MAX_BASENAME_BYTES);
        assert!(collapsed.contains("..."));
        // Deterministic: same input, same collapsed name.
        assert_eq!(collapsed, collapsed_basename(&long));
        // Distinct long names stay distinct.
        assert_ne!(collapsed, collapsed_basename(&"y".repeat(300)));
    }
}
