use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use pax_domain::ProjectName;
use pax_resolver::{Resolved, ResolvedDistribution};
use pep508_rs::Requirement;
use tracing::debug;

use crate::graph::scc;
use crate::model::{
    LockStyle, LockedArtifact, LockedRequirement, LockedResolve, LockedVertex, Lockfile, Pin,
    LOCKFILE_VERSION, RESOLVER_VERSION,
};
use crate::LockError;

/// Accumulates resolve results and assembles a reproducible lock document.
///
/// All internal collections are ordered ones; whatever order distributions
/// are observed in, `finish` emits the same lock bytes.
pub struct LockObserver {
    style: LockStyle,
    requirements: Vec<String>,
    constraints: Vec<String>,
    requires_python: Option<String>,
    pip_version: Option<String>,
    // platform key (None under a universal lock) → pin → requirement
    observed: BTreeMap<Option<String>, BTreeMap<Pin, LockedRequirement>>,
}

impl LockObserver {
    #[must_use]
    pub fn new(style: LockStyle, requirements: Vec<String>, constraints: Vec<String>) -> Self {
        Self {
            style,
            requirements,
            constraints,
            requires_python: None,
            pip_version: None,
            observed: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_requires_python(mut self, requires_python: Option<String>) -> Self {
        self.requires_python = requires_python;
        self
    }

    #[must_use]
    pub fn with_pip_version(mut self, pip_version: Option<String>) -> Self {
        self.pip_version = pip_version;
        self
    }

    /// Fold one resolve's distributions into the lock under construction.
    pub fn observe(&mut self, resolved: &Resolved) {
        for distribution in &resolved.distributions {
            self.observe_distribution(distribution);
        }
    }

    fn observe_distribution(&mut self, distribution: &ResolvedDistribution) {
        let platform_key = match self.style {
            LockStyle::Universal => None,
            LockStyle::Strict | LockStyle::Sources => Some(distribution.target.id()),
        };
        let pin = Pin {
            project_name: distribution.distribution.name.clone(),
            version: distribution.distribution.version.to_string(),
        };
        // A `set`-iterating build backend can emit these in any order; the
        // sorted set makes the lock insensitive to that.
        let requires_dists: BTreeSet<String> = distribution
            .metadata
            .requires_dists
            .iter()
            .map(ToString::to_string)
            .collect();
        let artifact = LockedArtifact {
            url: format!(
                "file://{}",
                distribution.distribution.location.display()
            ),
            filename: distribution.distribution.wheel_filename.clone(),
            fingerprint: distribution.distribution.fingerprint.clone(),
        };
        let entry = self
            .observed
            .entry(platform_key)
            .or_default()
            .entry(pin.clone())
            .or_insert_with(|| LockedRequirement {
                pin,
                artifacts: Vec::new(),
                requires_dists: Vec::new(),
                requires_python: distribution
                    .metadata
                    .requires_python
                    .as_ref()
                    .map(ToString::to_string),
            });
        if !entry
            .artifacts
            .iter()
            .any(|existing| existing.fingerprint == artifact.fingerprint)
        {
            entry.artifacts.push(artifact);
            entry.artifacts.sort_by(|a, b| a.filename.cmp(&b.filename));
        }
        let mut merged: BTreeSet<String> = entry.requires_dists.iter().cloned().collect();
        merged.extend(requires_dists);
        entry.requires_dists = merged.into_iter().collect();
    }

    /// Assemble and validate the final lock document.
    pub fn finish(self, pax_version: &str) -> Result<Lockfile, LockError> {
        let mut locked_resolves = Vec::new();
        for (platform_tag, requirements_by_pin) in self.observed {
            let locked_requirements: Vec<LockedRequirement> =
                requirements_by_pin.into_values().collect();
            let dependency_graph = dependency_graph(&locked_requirements);
            locked_resolves.push(LockedResolve {
                platform_tag,
                locked_requirements,
                dependency_graph,
            });
        }
        debug!(
            "locking {} resolve(s) under style {:?}",
            locked_resolves.len(),
            self.style
        );
        let lockfile = Lockfile {
            version: LOCKFILE_VERSION,
            pax_version: pax_version.to_string(),
            style: self.style,
            requires_python: self.requires_python,
            pip_version: self.pip_version,
            resolver_version: RESOLVER_VERSION,
            requirements: self.requirements,
            constraints: self.constraints,
            locked_resolves,
        };
        lockfile.validate()?;
        Ok(lockfile)
    }
}

/// Collapse the resolve's dependency relation into a DAG rendering.
///
/// Mutually depending distributions (rare, but real) end up in one vertex,
/// so downstream consumers always see an acyclic graph.
fn dependency_graph(locked_requirements: &[LockedRequirement]) -> Vec<LockedVertex> {
    let known: BTreeSet<ProjectName> = locked_requirements
        .iter()
        .map(|requirement| requirement.pin.project_name.clone())
        .collect();
    let successors: BTreeMap<ProjectName, Vec<ProjectName>> = locked_requirements
        .iter()
        .map(|requirement| {
            let dependencies = requirement
                .requires_dists
                .iter()
                .filter_map(|raw| Requirement::from_str(raw).ok())
                .map(|parsed| ProjectName::new(&parsed.name.to_string()))
                .filter(|name| known.contains(name))
                .collect();
            (requirement.pin.project_name.clone(), dependencies)
        })
        .collect();
    let nodes: Vec<ProjectName> = known.into_iter().collect();
    let dag = scc(&nodes, |node| {
        successors.get(node).cloned().unwrap_or_default()
    });
    dag.vertices()
        .iter()
        .map(|vertex| LockedVertex {
            value: vertex.value.clone(),
            components: vertex.components.clone(),
            edges: vertex.edges.clone(),
        })
        .collect()
}
