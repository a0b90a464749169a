use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use pax_domain::{
    hash_dir, hash_file, Fingerprint, HashAlgorithm, ProjectName, Target, WheelName,
};
use pax_store::PaxRoot;
use pep508_rs::Requirement;
use tracing::debug;

use crate::metadata::DistMetadata;

/// A source (sdist, VCS checkout, or local project) that must be built into a
/// wheel for one target.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub target: Target,
    pub source_path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl BuildRequest {
    /// Fingerprint the source so equal content shares one cached build.
    pub fn from_source(target: &Target, source_path: &Path) -> Result<Self> {
        let fingerprint = if source_path.is_dir() {
            hash_dir(HashAlgorithm::Sha256, source_path)?
        } else {
            hash_file(HashAlgorithm::Sha256, source_path)?
        };
        Ok(Self {
            target: target.clone(),
            source_path: source_path.to_path_buf(),
            fingerprint,
        })
    }

    /// Cache slot for this build: one per source fingerprint per
    /// interpreter/platform tag.
    #[must_use]
    pub fn cache_dir(&self, root: &PaxRoot) -> PathBuf {
        root.built_wheels_dir()
            .join(&self.fingerprint.hash)
            .join(self.target.id())
    }
}

/// A finalized build: the cache directory holding exactly one wheel.
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub request: BuildRequest,
    pub wheel_dir: PathBuf,
}

impl BuildResult {
    /// Convert the built wheel into an install request.
    ///
    /// The one-wheel invariant is structural: `pip wheel --no-deps` on a
    /// single source produces a single wheel, so anything else means the
    /// cache slot was corrupted.
    pub fn finalize(&self) -> Result<InstallRequest> {
        let mut wheels = Vec::new();
        for entry in fs::read_dir(&self.wheel_dir)
            .with_context(|| format!("failed to list {}", self.wheel_dir.display()))?
        {
            let path = entry?.path();
            if pax_domain::is_wheel_path(&path) {
                wheels.push(path);
            }
        }
        if wheels.len() != 1 {
            bail!(
                "expected exactly one wheel in {}, found {}",
                self.wheel_dir.display(),
                wheels.len()
            );
        }
        let wheel_path = wheels.remove(0);
        let filename = wheel_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let wheel_name = WheelName::parse(&filename)?;
        // A freshly built wheel may still not run on a foreign target; check
        // conservatively before paying for an install.
        if self.request.target.is_foreign() {
            self.request
                .target
                .check_wheel_platform(&wheel_name.platform_tag)?;
        }
        InstallRequest::from_wheel(&self.request.target, &wheel_path)
    }
}

/// A wheel that must be unpacked into an importable chroot for one target.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub target: Target,
    pub wheel_path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl InstallRequest {
    pub fn from_wheel(target: &Target, wheel_path: &Path) -> Result<Self> {
        Ok(Self {
            target: target.clone(),
            wheel_path: wheel_path.to_path_buf(),
            fingerprint: hash_file(HashAlgorithm::Sha256, wheel_path)?,
        })
    }

    pub fn wheel_filename(&self) -> String {
        self.wheel_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn wheel_name(&self) -> Result<WheelName> {
        WheelName::parse(&self.wheel_filename())
    }

    /// Cache slot for this install: one per wheel fingerprint.
    #[must_use]
    pub fn cache_dir(&self, root: &PaxRoot) -> PathBuf {
        root.installed_wheels_dir()
            .join(&self.fingerprint.hash)
            .join(self.wheel_filename())
    }
}

/// A finalized install: an immutable unpacked wheel chroot.
#[derive(Clone, Debug)]
pub struct InstallResult {
    pub request: InstallRequest,
    pub installation_root: PathBuf,
}

impl InstallResult {
    /// Read back the installed distribution and link its runtime key.
    pub fn finalize(&self, root: &PaxRoot) -> Result<ResolvedDistribution> {
        let metadata = DistMetadata::from_install_chroot(&self.installation_root)?;
        link_runtime_key(root, &self.installation_root)?;
        // Parse as a validity check even though the raw filename is kept.
        let _ = self.request.wheel_name()?;
        Ok(ResolvedDistribution {
            target: self.request.target.clone(),
            distribution: FingerprintedDistribution {
                name: metadata.name.clone(),
                version: metadata.version.clone(),
                location: self.installation_root.clone(),
                fingerprint: self.request.fingerprint.clone(),
                wheel_filename: self.request.wheel_filename(),
            },
            metadata,
            direct_requirements: Vec::new(),
        })
    }
}

/// Key the unpacked chroot by its own content hash and point that key at the
/// build-time slot. A wheel rebuilt under different circumstances but
/// unpacking to identical bytes then short-circuits to this chroot instead of
/// re-exploding.
fn link_runtime_key(root: &PaxRoot, installation_root: &Path) -> Result<()> {
    let runtime_fingerprint = hash_dir(HashAlgorithm::Sha256, installation_root)?;
    let runtime_key = root
        .installed_wheels_dir()
        .join(format!("runtime-{}", runtime_fingerprint.hash));
    if runtime_key.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        if let Err(err) = std::os::unix::fs::symlink(installation_root, &runtime_key) {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                debug!(
                    key = %runtime_key.display(),
                    "failed to link runtime key: {err}"
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        // No symlinks without elevated rights; record the mapping as a file.
        let _ = fs::write(
            &runtime_key,
            installation_root.to_string_lossy().as_bytes(),
        );
    }
    Ok(())
}

/// An installed distribution plus its identity and provenance.
#[derive(Clone, Debug)]
pub struct FingerprintedDistribution {
    pub name: ProjectName,
    pub version: pep440_rs::Version,
    /// The unpacked chroot; import roots live directly beneath it.
    pub location: PathBuf,
    /// Wheel-file fingerprint, the install cache key.
    pub fingerprint: Fingerprint,
    pub wheel_filename: String,
}

/// The terminal state of one requirement on one target.
#[derive(Clone, Debug)]
pub struct ResolvedDistribution {
    pub target: Target,
    pub distribution: FingerprintedDistribution,
    pub metadata: DistMetadata,
    /// Root requirement strings that directly asked for this distribution.
    pub direct_requirements: Vec<Requirement>,
}
