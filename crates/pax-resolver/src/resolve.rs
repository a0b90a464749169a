use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use pax_cache::{atomic_directory, LockStyle};
use pax_domain::{ProjectName, Target};
use pax_jobs::{execute_parallel, map_parallel, ManagedJob, ParallelResult, Raise, SpawnedJob};
use pax_store::PaxRoot;
use pep508_rs::Requirement;
use tracing::{debug, info};

use crate::pip::Pip;
use crate::requests::{
    BuildRequest, BuildResult, InstallRequest, InstallResult, ResolvedDistribution,
};
use crate::settings::ResolverSettings;
use crate::ResolveError;

/// Inputs for one resolve run.
#[derive(Clone, Debug)]
pub struct ResolveRequest {
    pub targets: Vec<Target>,
    pub requirements: Vec<String>,
    pub constraint_files: Vec<PathBuf>,
    pub settings: ResolverSettings,
}

/// The in-process result of a resolve: every distribution installed for every
/// target, in deterministic order.
#[derive(Debug)]
pub struct Resolved {
    pub distributions: Vec<ResolvedDistribution>,
}

/// Everything pip downloaded for one target.
#[derive(Debug)]
struct TargetDownloads {
    target: Target,
    files: Vec<PathBuf>,
}

/// Run the full pipeline: download per target, build sdists, install wheels,
/// then chase direct `file://` dependencies to a fixpoint.
pub fn resolve(
    root: &PaxRoot,
    pip: &Pip,
    request: &ResolveRequest,
) -> Result<Resolved, ResolveError> {
    fs::create_dir_all(root.path())
        .with_context(|| format!("failed to create cache root {}", root.path().display()))
        .map_err(ResolveError::Other)?;
    let staging = tempfile::tempdir_in(root.path())
        .context("failed to create resolve staging directory")
        .map_err(ResolveError::Other)?;

    let downloads = download_all(pip, request, staging.path())?;

    // Phase 2: sort each target's downloads into already-built wheels and
    // sources needing a build.
    let mut build_requests = Vec::new();
    let mut install_requests = Vec::new();
    for downloaded in &downloads {
        let (installs, builds) =
            categorize_downloads(&downloaded.target, &downloaded.files).map_err(ResolveError::Other)?;
        build_requests.extend(builds);
        install_requests.extend(installs);
    }

    // Phase 3/4: build then install, both fingerprint-deduplicated.
    install_requests.extend(run_builds(root, pip, &request.settings, build_requests, staging.path())?);
    let mut distributions = run_installs(root, pip, &request.settings, install_requests, staging.path())?;

    resolve_direct_file_deps(root, pip, &request.settings, staging.path(), &mut distributions)?;

    attach_direct_requirements(&request.requirements, &mut distributions);
    distributions.sort_by(|a, b| {
        (a.target.id(), &a.distribution.name, &a.distribution.version)
            .cmp(&(b.target.id(), &b.distribution.name, &b.distribution.version))
    });
    info!(
        "resolved {} distribution(s) across {} target(s)",
        distributions.len(),
        downloads.len()
    );
    Ok(Resolved { distributions })
}

/// Artifacts fetched for one target, persisted into the download cache.
#[derive(Debug)]
pub struct DownloadedTarget {
    pub target: Target,
    pub artifacts: Vec<pax_store::DownloadedArtifact>,
}

/// Run only the download phase, persisting every fetched file into the
/// content-addressed `downloads/` cache.
pub fn download(
    root: &PaxRoot,
    pip: &Pip,
    request: &ResolveRequest,
) -> Result<Vec<DownloadedTarget>, ResolveError> {
    fs::create_dir_all(root.path())
        .with_context(|| format!("failed to create cache root {}", root.path().display()))
        .map_err(ResolveError::Other)?;
    let staging = tempfile::tempdir_in(root.path())
        .context("failed to create download staging directory")
        .map_err(ResolveError::Other)?;

    let manager = pax_store::DownloadManager::new(root);
    let mut downloaded = Vec::new();
    for target_downloads in download_all(pip, request, staging.path())? {
        let mut artifacts = Vec::new();
        for file in &target_downloads.files {
            let project_name = project_name_of(file);
            let artifact =
                pax_store::LocalFileArtifact::new(file).map_err(ResolveError::Other)?;
            artifacts.push(
                manager
                    .store(&artifact, &project_name)
                    .map_err(ResolveError::Other)?,
            );
        }
        downloaded.push(DownloadedTarget {
            target: target_downloads.target,
            artifacts,
        });
    }
    Ok(downloaded)
}

fn project_name_of(file: &Path) -> ProjectName {
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Ok(wheel) = pax_domain::WheelName::parse(&filename) {
        return wheel.distribution;
    }
    if let Ok(sdist) = pax_domain::SdistName::parse(&filename) {
        return sdist.distribution;
    }
    ProjectName::new(&filename)
}

/// Phase 1: one pip download invocation per unique target, in parallel. Any
/// failure is fatal to the whole resolve.
fn download_all(
    pip: &Pip,
    request: &ResolveRequest,
    staging: &Path,
) -> Result<Vec<TargetDownloads>, ResolveError> {
    let mut unique_targets: IndexMap<String, Target> = IndexMap::new();
    for target in &request.targets {
        unique_targets.entry(target.id()).or_insert_with(|| target.clone());
    }

    let pip = pip.clone();
    let requirements = request.requirements.clone();
    let constraint_files = request.constraint_files.clone();
    let settings = request.settings.clone();
    let staging = staging.to_path_buf();

    let mut downloads = Vec::new();
    let results = execute_parallel(
        unique_targets.into_values().collect(),
        move |target: &Target| {
            let dest_dir = staging.join(format!("downloads-{}", target.id()));
            fs::create_dir_all(&dest_dir)?;
            let log_path = staging.join(format!("pip-download-{}.log", target.id()));
            let job = pip.spawn_download(
                target,
                &requirements,
                &constraint_files,
                &dest_dir,
                &log_path,
                &settings,
            )?;
            let target = target.clone();
            Ok(SpawnedJob::and_then(job, move || {
                let mut files: Vec<PathBuf> = fs::read_dir(&dest_dir)?
                    .map(|entry| entry.map(|entry| entry.path()))
                    .collect::<std::io::Result<_>>()?;
                files.sort();
                Ok(TargetDownloads { target, files })
            }))
        },
        Raise,
        request.settings.max_jobs,
    );
    for item in results {
        match item {
            Ok(ParallelResult::Success(target_downloads)) => downloads.push(target_downloads),
            Ok(ParallelResult::Failed { .. }) => unreachable!("Raise policy never yields failures"),
            Err(error) => {
                return Err(ResolveError::Unsatisfiable(format!("{error:#}")));
            }
        }
    }
    Ok(downloads)
}

/// Wheels convert straight to install requests; sdists and source trees need
/// a build first. Anything unrecognized is rejected rather than ignored.
fn categorize_downloads(
    target: &Target,
    files: &[PathBuf],
) -> Result<(Vec<InstallRequest>, Vec<BuildRequest>)> {
    let mut installs = Vec::new();
    let mut builds = Vec::new();
    for file in files {
        if pax_domain::is_wheel_path(file) {
            installs.push(InstallRequest::from_wheel(target, file)?);
        } else if pax_domain::is_sdist_path(file) || file.is_dir() {
            builds.push(BuildRequest::from_source(target, file)?);
        } else {
            anyhow::bail!(
                "downloaded file {} is neither a wheel nor a source distribution",
                file.display()
            );
        }
    }
    Ok((installs, builds))
}

/// Phase 3: run deduplicated builds in parallel; each distinct source
/// fingerprint builds at most once per target, enforced by the atomic cache
/// slot even across unrelated pax processes.
fn run_builds(
    root: &PaxRoot,
    pip: &Pip,
    settings: &ResolverSettings,
    build_requests: Vec<BuildRequest>,
    staging: &Path,
) -> Result<Vec<InstallRequest>, ResolveError> {
    if build_requests.is_empty() {
        return Ok(Vec::new());
    }
    let mut unique: IndexMap<(String, String), BuildRequest> = IndexMap::new();
    for request in build_requests {
        unique
            .entry((request.fingerprint.hash.clone(), request.target.id()))
            .or_insert(request);
    }
    debug!("building {} distinct source(s)", unique.len());

    let outcomes = map_parallel(
        unique.into_values().collect(),
        |request| Ok(build_one(root, pip, settings, &request, staging)),
        settings.max_jobs,
        "build",
    )
    .map_err(ResolveError::Other)?;

    collect_phase("build", outcomes)
}

fn build_one(
    root: &PaxRoot,
    pip: &Pip,
    settings: &ResolverSettings,
    request: &BuildRequest,
    staging: &Path,
) -> Result<InstallRequest, String> {
    let cache_dir = request.cache_dir(root);
    let log_path = staging.join(format!(
        "pip-build-{}-{}.log",
        &request.fingerprint.hash[..16.min(request.fingerprint.hash.len())],
        request.target.id()
    ));
    let populate = |work_dir: &Path| {
        let mut job = pip.spawn_build(&request.source_path, work_dir, &log_path, settings)?;
        job.wait().map_err(anyhow::Error::new)?;
        Ok(())
    };
    atomic_directory(&cache_dir, LockStyle::Bsd, populate)
        .and_then(|atomic_dir| {
            BuildResult {
                request: request.clone(),
                wheel_dir: atomic_dir.target_dir().to_path_buf(),
            }
            .finalize()
        })
        .map_err(|err| format!("{}: {err:#}", request.source_path.display()))
}

/// Phase 4: install deduplicated wheels in parallel and finalize each into a
/// resolved distribution.
fn run_installs(
    root: &PaxRoot,
    pip: &Pip,
    settings: &ResolverSettings,
    install_requests: Vec<InstallRequest>,
    staging: &Path,
) -> Result<Vec<ResolvedDistribution>, ResolveError> {
    if install_requests.is_empty() {
        return Ok(Vec::new());
    }
    let mut unique: IndexMap<(String, String), InstallRequest> = IndexMap::new();
    for request in install_requests {
        unique
            .entry((request.fingerprint.hash.clone(), request.target.id()))
            .or_insert(request);
    }
    debug!("installing {} distinct wheel(s)", unique.len());

    let outcomes = map_parallel(
        unique.into_values().collect(),
        |request| Ok(install_one(root, pip, &request, staging)),
        settings.max_jobs,
        "install",
    )
    .map_err(ResolveError::Other)?;

    let distributions = collect_phase("install", outcomes)?;
    for distribution in &distributions {
        check_requires_python(distribution)?;
    }
    Ok(distributions)
}

fn install_one(
    root: &PaxRoot,
    pip: &Pip,
    request: &InstallRequest,
    staging: &Path,
) -> Result<ResolvedDistribution, String> {
    let cache_dir = request.cache_dir(root);
    let log_path = staging.join(format!(
        "pip-install-{}.log",
        &request.fingerprint.hash[..16.min(request.fingerprint.hash.len())]
    ));
    let populate = |work_dir: &Path| {
        let mut job = pip.spawn_install(&request.wheel_path, work_dir, &log_path)?;
        job.wait().map_err(anyhow::Error::new)?;
        Ok(())
    };
    atomic_directory(&cache_dir, LockStyle::Bsd, populate)
        .and_then(|atomic_dir| {
            InstallResult {
                request: request.clone(),
                installation_root: atomic_dir.target_dir().to_path_buf(),
            }
            .finalize(root)
        })
        .map_err(|err| format!("{}: {err:#}", request.wheel_path.display()))
}

/// Fold per-item failures into one aggregated, numbered error.
fn collect_phase<T>(
    noun: &str,
    outcomes: Vec<Result<T, String>>,
) -> Result<Vec<T>, ResolveError> {
    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(value) => successes.push(value),
            Err(failure) => failures.push(failure),
        }
    }
    if failures.is_empty() {
        return Ok(successes);
    }
    let requirement = if failures.len() == 1 {
        failures[0]
            .split(':')
            .next()
            .unwrap_or("unknown source")
            .to_string()
    } else {
        format!("{} sources", failures.len())
    };
    Err(ResolveError::Untranslatable {
        requirement,
        reason: ResolveError::aggregate(noun, &failures),
    })
}

fn check_requires_python(distribution: &ResolvedDistribution) -> Result<(), ResolveError> {
    let Some(requires_python) = &distribution.metadata.requires_python else {
        return Ok(());
    };
    let Some(version) = distribution.target.python_version() else {
        // An abbreviated target without a pinned version cannot be checked.
        return Ok(());
    };
    if !requires_python.contains(version) {
        return Err(ResolveError::requires_python(
            distribution.distribution.name.as_str(),
            requires_python,
            &distribution.target,
        ));
    }
    Ok(())
}

/// Phase 5: chase direct `file://` dependencies to a fixpoint.
///
/// An explicit worklist over an owned visited set: each newly installed
/// distribution may declare local sibling projects that themselves need a
/// build and install. Every project name is analyzed at most once, so the
/// loop terminates on arbitrarily deep (even cyclic) local reference chains.
fn resolve_direct_file_deps(
    root: &PaxRoot,
    pip: &Pip,
    settings: &ResolverSettings,
    staging: &Path,
    distributions: &mut Vec<ResolvedDistribution>,
) -> Result<(), ResolveError> {
    let mut analyzed: HashSet<(String, ProjectName)> = distributions
        .iter()
        .map(|dist| (dist.target.id(), dist.distribution.name.clone()))
        .collect();
    let mut worklist: Vec<(Target, ProjectName, PathBuf)> = Vec::new();
    for distribution in distributions.iter() {
        for (name, path) in distribution.metadata.direct_file_dependencies() {
            worklist.push((distribution.target.clone(), name, path));
        }
    }

    while let Some((target, name, path)) = worklist.pop() {
        if !analyzed.insert((target.id(), name.clone())) {
            continue;
        }
        if !path.exists() {
            return Err(ResolveError::Untranslatable {
                requirement: name.to_string(),
                reason: format!("direct file dependency {} does not exist", path.display()),
            });
        }
        debug!(project = %name, "resolving direct file dependency at {}", path.display());
        let build_request =
            BuildRequest::from_source(&target, &path).map_err(ResolveError::Other)?;
        let install_request = build_one(root, pip, settings, &build_request, staging)
            .map_err(|reason| ResolveError::Untranslatable {
                requirement: name.to_string(),
                reason,
            })?;
        let resolved = install_one(root, pip, &install_request, staging).map_err(|reason| {
            ResolveError::Untranslatable {
                requirement: name.to_string(),
                reason,
            }
        })?;
        for (dep_name, dep_path) in resolved.metadata.direct_file_dependencies() {
            if !analyzed.contains(&(target.id(), dep_name.clone())) {
                worklist.push((target.clone(), dep_name, dep_path));
            }
        }
        distributions.push(resolved);
    }
    Ok(())
}

/// Mark which resolved distributions were asked for by name at the top level.
fn attach_direct_requirements(
    requirements: &[String],
    distributions: &mut [ResolvedDistribution],
) {
    let parsed: Vec<Requirement> = requirements
        .iter()
        .filter_map(|raw| Requirement::from_str(raw.trim()).ok())
        .collect();
    for distribution in distributions {
        distribution.direct_requirements = parsed
            .iter()
            .filter(|requirement| {
                ProjectName::new(&requirement.name.to_string()) == distribution.distribution.name
            })
            .cloned()
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorization_splits_wheels_from_sources() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let wheel = temp.path().join("demo-1.0-py3-none-any.whl");
        let sdist = temp.path().join("demo-1.0.tar.gz");
        let tree = temp.path().join("local-proj");
        fs::write(&wheel, b"wheel bytes")?;
        fs::write(&sdist, b"sdist bytes")?;
        fs::create_dir(&tree)?;
        fs::write(tree.join("setup.py"), b"")?;

        let target = Target::Abbreviated(pax_domain::AbbreviatedPlatform {
            platform_tag: "any".to_string(),
            python_version: None,
        });
        let (installs, builds) =
            categorize_downloads(&target, &[wheel, sdist.clone(), tree.clone()])?;
        assert_eq!(installs.len(), 1);
        assert_eq!(builds.len(), 2);
        assert!(builds.iter().any(|request| request.source_path == sdist));
        assert!(builds.iter().any(|request| request.source_path == tree));

        let junk = temp.path().join("mystery.bin");
        fs::write(&junk, b"?")?;
        assert!(categorize_downloads(&target, &[junk]).is_err());
        Ok(())
    }

    #[test]
    fn download_project_names_come_from_filenames() {
        assert_eq!(
            project_name_of(Path::new("dl/AnsiColors-1.1.8-py2.py3-none-any.whl")),
            ProjectName::new("ansicolors")
        );
        assert_eq!(
            project_name_of(Path::new("dl/Demo_Pkg-2.0.tar.gz")),
            ProjectName::new("demo-pkg")
        );
        assert_eq!(
            project_name_of(Path::new("dl/odd-download")),
            ProjectName::new("odd-download")
        );
    }

    #[test]
    fn phase_failures_aggregate_into_untranslatable() {
        let outcomes: Vec<Result<u32, String>> = vec![
            Ok(1),
            Err("a.tar.gz: compiler missing".to_string()),
            Err("b.tar.gz: bad metadata".to_string()),
        ];
        match collect_phase("build", outcomes).unwrap_err() {
            ResolveError::Untranslatable { requirement, reason } => {
                assert_eq!(requirement, "2 sources");
                assert!(reason.starts_with("2 builds failed:"));
                assert!(reason.contains("1. a.tar.gz"));
                assert!(reason.contains("2. b.tar.gz"));
            }
            other => panic!("expected Untranslatable, got {other:?}"),
        }
    }

    #[test]
    fn single_phase_failure_names_the_source() {
        let outcomes: Vec<Result<u32, String>> =
            vec![Err("/work/demo: exploded".to_string())];
        match collect_phase("build", outcomes).unwrap_err() {
            ResolveError::Untranslatable { requirement, .. } => {
                assert_eq!(requirement, "/work/demo");
            }
            other => panic!("expected Untranslatable, got {other:?}"),
        }
    }
}
