//! Fingerprint-keyed, atomic, cached persistence of resolve artifacts.

mod artifacts;
mod root;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pax_cache::{atomic_directory, LockStyle};
use pax_domain::{Fingerprint, ProjectName};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use artifacts::{LocalFileArtifact, LocalProjectArtifact, UrlArtifact, VcsArtifact};
pub use root::PaxRoot;

const SIDECAR_NAME: &str = ".fingerprint.json";
const SIDECAR_VERSION: u32 = 1;

/// Store-layer failures callers are expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(
        "downloaded artifact '{filename}' hash mismatch (expected {expected}, found {actual})"
    )]
    HashMismatch {
        filename: String,
        expected: Fingerprint,
        actual: Fingerprint,
    },
    #[error("cached download at {0} is missing its fingerprint sidecar")]
    MissingSidecar(PathBuf),
}

/// What a [`Downloadable`] persisted into the work dir.
#[derive(Debug)]
pub struct SavedArtifact {
    /// Name of the payload file or directory created inside the work dir.
    pub filename: String,
    /// Digest of the payload bytes, computed while saving.
    pub fingerprint: Fingerprint,
}

/// The extension point of the download cache. Implementations fetch one kind
/// of artifact (remote file, VCS checkout, local project) into a destination
/// directory.
pub trait Downloadable {
    /// The cache key. Must be reproducible for identical content.
    fn fingerprint(&self) -> &Fingerprint;

    /// Whether the expected hash was asserted ahead of time (e.g. read from a
    /// lock file) so the post-save verification can be skipped.
    fn already_verified(&self) -> bool {
        false
    }

    /// Fetch the artifact into `dest_dir`.
    fn save(&self, dest_dir: &Path, project_name: &ProjectName) -> Result<SavedArtifact>;
}

/// A persisted, immutable cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    version: u32,
    filename: String,
    fingerprint: Fingerprint,
}

/// Fingerprint-keyed artifact cache under `downloads/`.
///
/// `store` is safe to call from any number of processes and threads for the
/// same artifact; exactly one performs the fetch and the rest observe the
/// finalized entry.
#[derive(Clone, Debug)]
pub struct DownloadManager {
    downloads_dir: PathBuf,
    lock_style: LockStyle,
}

impl DownloadManager {
    #[must_use]
    pub fn new(root: &PaxRoot) -> Self {
        Self {
            downloads_dir: root.downloads_dir(),
            lock_style: LockStyle::default(),
        }
    }

    #[must_use]
    pub fn with_lock_style(mut self, lock_style: LockStyle) -> Self {
        self.lock_style = lock_style;
        self
    }

    /// Fetch-or-hit the cache entry for `artifact`.
    pub fn store(
        &self,
        artifact: &dyn Downloadable,
        project_name: &ProjectName,
    ) -> Result<DownloadedArtifact> {
        let cache_dir = self.downloads_dir.join(&artifact.fingerprint().hash);
        let atomic_dir = atomic_directory(&cache_dir, self.lock_style, |work_dir| {
            let saved = artifact.save(work_dir, project_name)?;
            if !artifact.already_verified() && saved.fingerprint != *artifact.fingerprint() {
                return Err(StoreError::HashMismatch {
                    filename: saved.filename,
                    expected: artifact.fingerprint().clone(),
                    actual: saved.fingerprint,
                }
                .into());
            }
            let sidecar = Sidecar {
                version: SIDECAR_VERSION,
                filename: saved.filename,
                fingerprint: saved.fingerprint,
            };
            fs::write(
                work_dir.join(SIDECAR_NAME),
                serde_json::to_string_pretty(&sidecar)?,
            )
            .context("failed to write fingerprint sidecar")?;
            debug!(project = %project_name, "cached download for {}", artifact.fingerprint());
            Ok(())
        })?;
        self.load(atomic_dir.target_dir())
    }

    /// Read the artifact back from a finalized cache directory.
    fn load(&self, cache_dir: &Path) -> Result<DownloadedArtifact> {
        let sidecar_path = cache_dir.join(SIDECAR_NAME);
        let raw = fs::read_to_string(&sidecar_path)
            .map_err(|_| StoreError::MissingSidecar(cache_dir.to_path_buf()))?;
        let sidecar: Sidecar = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt sidecar at {}", sidecar_path.display()))?;
        Ok(DownloadedArtifact {
            path: cache_dir.join(sidecar.filename),
            fingerprint: sidecar.fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pax_domain::{hash_file, HashAlgorithm};

    use super::*;

    struct TestArtifact {
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        verified: bool,
        save_calls: AtomicUsize,
    }

    impl TestArtifact {
        fn new(payload: &[u8]) -> Self {
            let mut hasher = HashAlgorithm::Sha256.new_hasher();
            hasher.update(payload);
            Self {
                payload: payload.to_vec(),
                fingerprint: hasher.finish(),
                verified: false,
                save_calls: AtomicUsize::new(0),
            }
        }
    }

    impl Downloadable for TestArtifact {
        fn fingerprint(&self) -> &Fingerprint {
            &self.fingerprint
        }

        fn already_verified(&self) -> bool {
            self.verified
        }

        fn save(&self, dest_dir: &Path, _project_name: &ProjectName) -> Result<SavedArtifact> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            let path = dest_dir.join("payload.bin");
            fs::write(&path, &self.payload)?;
            Ok(SavedArtifact {
                filename: "payload.bin".to_string(),
                fingerprint: hash_file(HashAlgorithm::Sha256, &path)?,
            })
        }
    }

    fn manager(temp: &tempfile::TempDir) -> DownloadManager {
        DownloadManager::new(&PaxRoot::at(temp.path().join("store")))
    }

    #[test]
    fn second_store_hits_the_cache() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(&temp);
        let artifact = TestArtifact::new(b"wheel bytes");
        let name = ProjectName::new("demo");

        let first = manager.store(&artifact, &name)?;
        let second = manager.store(&artifact, &name)?;

        assert_eq!(artifact.save_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(fs::read(&first.path)?, b"wheel bytes");
        assert_eq!(first.fingerprint, *artifact.fingerprint());
        Ok(())
    }

    #[test]
    fn hash_mismatch_is_a_typed_error_and_caches_nothing() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(&temp);
        let mut artifact = TestArtifact::new(b"expected bytes");
        // Claim a different expected hash than what save() will produce.
        artifact.fingerprint.hash = "0".repeat(64);
        let name = ProjectName::new("demo");

        let error = manager.store(&artifact, &name).unwrap_err();
        assert!(error.downcast_ref::<StoreError>().is_some());

        // The failed population must not have published a cache entry.
        let cache_dir = temp
            .path()
            .join("store/downloads")
            .join(&artifact.fingerprint.hash);
        assert!(!cache_dir.exists());
        Ok(())
    }

    #[test]
    fn verified_artifacts_skip_hash_checking() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = manager(&temp);
        let mut artifact = TestArtifact::new(b"locked bytes");
        artifact.fingerprint.hash = "f".repeat(64);
        artifact.verified = true;
        let name = ProjectName::new("demo");

        // Mismatch is tolerated because the hash was asserted up front.
        let stored = manager.store(&artifact, &name)?;
        assert_eq!(fs::read(&stored.path)?, b"locked bytes");
        Ok(())
    }
}
