//! The resolve pipeline: drive pip downloads per target, build sdists into
//! wheels, install wheels into reusable chroots, and surface the results as
//! resolved distributions.

mod metadata;
mod pip;
mod requests;
mod resolve;
mod settings;

pub use metadata::DistMetadata;
pub use pip::{Pip, PipErrorAnalyzer};
pub use requests::{
    BuildRequest, BuildResult, FingerprintedDistribution, InstallRequest, InstallResult,
    ResolvedDistribution,
};
pub use resolve::{download, resolve, DownloadedTarget, ResolveRequest, Resolved};
pub use settings::{NetworkSettings, ResolverSettings};

use pax_domain::Target;

/// Failures surfaced by the resolve pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The download/resolve phase could not satisfy the requirements.
    #[error("Failed to resolve requirements:\n{0}")]
    Unsatisfiable(String),

    /// No installable distribution could be produced for a requirement.
    #[error("Could not translate {requirement} into a usable distribution:\n{reason}")]
    Untranslatable { requirement: String, reason: String },

    /// The target interpreter is outside a distribution's supported range.
    #[error(
        "{distribution} requires Python {requires_python}, which target {target} does not satisfy"
    )]
    RequiresPython {
        distribution: String,
        requires_python: String,
        target: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResolveError {
    /// Aggregate per-item failures into one numbered report.
    #[must_use]
    pub fn aggregate(noun: &str, failures: &[String]) -> String {
        let mut report = if failures.len() == 1 {
            format!("1 {noun} failed:\n")
        } else {
            format!("{} {noun}s failed:\n", failures.len())
        };
        for (index, failure) in failures.iter().enumerate() {
            report.push_str(&format!("{}. {failure}\n", index + 1));
        }
        report.truncate(report.trim_end().len());
        report
    }

    pub(crate) fn requires_python(
        distribution: &str,
        requires_python: &pep440_rs::VersionSpecifiers,
        target: &Target,
    ) -> Self {
        Self::RequiresPython {
            distribution: distribution.to_string(),
            requires_python: requires_python.to_string(),
            target: target.id(),
        }
    }
}
