//! Lock-file creation: a Tarjan SCC pass over the dependency graph, a
//! versioned lock model, and canonical JSON rendering that reproduces
//! byte-identical output for identical resolves.

mod graph;
mod json;
mod model;
mod observer;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use pax_resolver::{resolve, Pip, ResolveRequest};
use pax_store::PaxRoot;

pub use graph::{scc, DirectedAcyclicGraph, Vertex};
pub use json::{parse, render};
pub use model::{
    LockStyle, LockedArtifact, LockedRequirement, LockedResolve, LockedVertex, Lockfile, Pin,
    LOCKFILE_VERSION, RESOLVER_VERSION,
};
pub use observer::LockObserver;

/// Lock-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("invalid lock document: {0}")]
    Invalid(String),
    #[error("failed to serialize lock document: {0}")]
    Serialize(String),
    #[error("failed to parse lock document: {0}")]
    Parse(String),
    #[error("unsupported lock version {found} (supported: {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },
}

impl Lockfile {
    /// Digest of the canonical rendering, usable as a lock identity.
    pub fn fingerprint(&self) -> Result<pax_domain::Fingerprint, LockError> {
        let rendered = render(self)?;
        let mut hasher = pax_domain::HashAlgorithm::Sha256.new_hasher();
        hasher.update(rendered.as_bytes());
        Ok(hasher.finish())
    }
}

/// Drive a full resolve and persist the resulting lock document.
///
/// This is the whole lock-creation path: resolve every target, observe the
/// distributions, render canonically, and write the file.
pub fn create_lock(
    root: &PaxRoot,
    pip: &Pip,
    request: &ResolveRequest,
    style: LockStyle,
    pax_version: &str,
    output: &Path,
) -> Result<Lockfile> {
    let resolved = resolve(root, pip, request)?;
    let mut observer = LockObserver::new(
        style,
        request.requirements.clone(),
        request
            .constraint_files
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect(),
    );
    observer.observe(&resolved);
    let lockfile = observer.finish(pax_version)?;
    let rendered = render(&lockfile)?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(output, rendered)
        .with_context(|| format!("failed to write lock file {}", output.display()))?;
    Ok(lockfile)
}

/// Load and validate a previously created lock document.
pub fn load_lock(path: &Path) -> Result<Lockfile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    Ok(parse(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_fingerprint_tracks_content() -> Result<()> {
        let base = Lockfile {
            version: LOCKFILE_VERSION,
            pax_version: "0.1.0".to_string(),
            style: LockStyle::Universal,
            requires_python: None,
            pip_version: None,
            resolver_version: 1,
            requirements: vec!["ansicolors==1.1.8".to_string()],
            constraints: Vec::new(),
            locked_resolves: vec![LockedResolve {
                platform_tag: None,
                locked_requirements: Vec::new(),
                dependency_graph: Vec::new(),
            }],
        };
        let same = base.clone();
        assert_eq!(base.fingerprint()?, same.fingerprint()?);

        let mut changed = base.clone();
        changed.requirements.push("extra==1.0".to_string());
        assert_ne!(base.fingerprint()?, changed.fingerprint()?);
        Ok(())
    }
}
