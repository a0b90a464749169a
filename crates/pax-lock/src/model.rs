use pax_domain::{Fingerprint, ProjectName};
use serde::{Deserialize, Serialize};

/// Current lock document schema version.
pub const LOCKFILE_VERSION: u32 = 1;

/// Current resolve pipeline semantics version.
pub const RESOLVER_VERSION: u32 = 1;

/// How much a lock commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockStyle {
    /// One resolve per concrete target, wheels only.
    Strict,
    /// One resolve per concrete target, sources allowed.
    Sources,
    /// One resolve usable across targets; carries no platform tag.
    Universal,
}

/// One installable artifact pinned by content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedArtifact {
    pub url: String,
    pub filename: String,
    pub fingerprint: Fingerprint,
}

/// The project/version pair a locked requirement commits to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pin {
    pub project_name: ProjectName,
    pub version: String,
}

/// One fully pinned requirement within a resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedRequirement {
    pub pin: Pin,
    pub artifacts: Vec<LockedArtifact>,
    /// Declared dependencies, as requirement strings, sorted and deduped.
    pub requires_dists: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
}

/// A collapsed dependency-graph vertex as rendered into the lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedVertex {
    pub value: ProjectName,
    pub components: Vec<ProjectName>,
    pub edges: Vec<ProjectName>,
}

/// Everything locked for one concrete target (or for all targets under a
/// universal lock).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedResolve {
    /// Absent exactly when the lock style is universal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_tag: Option<String>,
    pub locked_requirements: Vec<LockedRequirement>,
    /// Dependency DAG with cycles collapsed, in topological order.
    pub dependency_graph: Vec<LockedVertex>,
}

/// A persisted, reproducible record of a full resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: u32,
    pub pax_version: String,
    pub style: LockStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_version: Option<String>,
    /// Version of the resolve pipeline semantics that produced this lock.
    pub resolver_version: u32,
    pub requirements: Vec<String>,
    pub constraints: Vec<String>,
    pub locked_resolves: Vec<LockedResolve>,
}

impl Lockfile {
    /// Check the style/resolve shape invariant: universal locks carry exactly
    /// one tag-free resolve, per-target locks tag every resolve.
    pub fn validate(&self) -> Result<(), crate::LockError> {
        match self.style {
            LockStyle::Universal => {
                if self.locked_resolves.len() != 1 {
                    return Err(crate::LockError::Invalid(format!(
                        "a universal lock must hold exactly one resolve, found {}",
                        self.locked_resolves.len()
                    )));
                }
                if self.locked_resolves[0].platform_tag.is_some() {
                    return Err(crate::LockError::Invalid(
                        "a universal lock must not carry a platform tag".to_string(),
                    ));
                }
            }
            LockStyle::Strict | LockStyle::Sources => {
                for resolve in &self.locked_resolves {
                    if resolve.platform_tag.is_none() {
                        return Err(crate::LockError::Invalid(
                            "per-target locks must tag every resolve".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_resolve(platform_tag: Option<&str>) -> LockedResolve {
        LockedResolve {
            platform_tag: platform_tag.map(ToString::to_string),
            locked_requirements: Vec::new(),
            dependency_graph: Vec::new(),
        }
    }

    fn lockfile(style: LockStyle, resolves: Vec<LockedResolve>) -> Lockfile {
        Lockfile {
            version: LOCKFILE_VERSION,
            pax_version: "0.1.0".to_string(),
            style,
            requires_python: None,
            pip_version: None,
            resolver_version: RESOLVER_VERSION,
            requirements: vec!["ansicolors==1.1.8".to_string()],
            constraints: Vec::new(),
            locked_resolves: resolves,
        }
    }

    #[test]
    fn universal_locks_are_single_and_tag_free() {
        assert!(lockfile(LockStyle::Universal, vec![empty_resolve(None)])
            .validate()
            .is_ok());
        assert!(lockfile(
            LockStyle::Universal,
            vec![empty_resolve(Some("manylinux2014_x86_64"))]
        )
        .validate()
        .is_err());
        assert!(lockfile(
            LockStyle::Universal,
            vec![empty_resolve(None), empty_resolve(None)]
        )
        .validate()
        .is_err());
    }

    #[test]
    fn strict_locks_tag_every_resolve() {
        assert!(lockfile(
            LockStyle::Strict,
            vec![empty_resolve(Some("manylinux2014_x86_64"))]
        )
        .validate()
        .is_ok());
        assert!(lockfile(LockStyle::Strict, vec![empty_resolve(None)])
            .validate()
            .is_err());
    }
}
