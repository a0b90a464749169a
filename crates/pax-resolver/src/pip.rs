use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use pax_domain::Target;
use pax_jobs::{Analysis, ErrorMessage, Job, LogAnalyzer, LogScrapeJob};
use tracing::debug;

use crate::settings::{NetworkSettings, ResolverSettings};

/// Driver for the external installer tool.
///
/// Pip is opaque to this pipeline: stdout is reserved for structured data,
/// diagnostics go to stderr, and `--log` captures an append-only log file
/// that is scraped for error messages when an invocation fails.
#[derive(Clone, Debug)]
pub struct Pip {
    python: PathBuf,
}

impl Pip {
    #[must_use]
    pub fn new(python: PathBuf) -> Self {
        Self { python }
    }

    #[must_use]
    pub fn python(&self) -> &Path {
        &self.python
    }

    fn base_command(&self, log_path: &Path) -> Vec<String> {
        vec![
            self.python.to_string_lossy().into_owned(),
            "-m".to_string(),
            "pip".to_string(),
            "--no-input".to_string(),
            "--disable-pip-version-check".to_string(),
            "--log".to_string(),
            log_path.to_string_lossy().into_owned(),
        ]
    }

    fn push_network_args(command: &mut Vec<String>, network: &NetworkSettings) {
        if let Some(proxy) = &network.proxy {
            command.push("--proxy".to_string());
            command.push(proxy.clone());
        }
        if let Some(cert) = &network.cert {
            command.push("--cert".to_string());
            command.push(cert.to_string_lossy().into_owned());
        }
        if let Some(client_cert) = &network.client_cert {
            command.push("--client-cert".to_string());
            command.push(client_cert.to_string_lossy().into_owned());
        }
        for host in &network.trusted_hosts {
            command.push("--trusted-host".to_string());
            command.push(host.clone());
        }
    }

    fn push_index_args(command: &mut Vec<String>, settings: &ResolverSettings) {
        if let Some(index_url) = &settings.index_url {
            command.push("--index-url".to_string());
            command.push(index_url.clone());
        }
        for extra in &settings.extra_index_urls {
            command.push("--extra-index-url".to_string());
            command.push(extra.clone());
        }
        for find_links in &settings.find_links {
            command.push("--find-links".to_string());
            command.push(find_links.clone());
        }
    }

    /// Foreign targets can only consume pre-built wheels; pip needs the full
    /// tag set spelled out to pick them.
    fn push_target_args(command: &mut Vec<String>, target: &Target) {
        if !target.is_foreign() {
            return;
        }
        command.push("--platform".to_string());
        command.push(target.platform_tag().to_string());
        if let Some(version) = target.python_version() {
            let release = version.release();
            let major = release.first().copied().unwrap_or(3);
            let minor = release.get(1).copied().unwrap_or(0);
            command.push("--python-version".to_string());
            command.push(format!("{major}.{minor}"));
        }
        command.push("--only-binary".to_string());
        command.push(":all:".to_string());
    }

    fn spawn(
        &self,
        command: Vec<String>,
        cwd: &Path,
        log_path: &Path,
    ) -> Result<LogScrapeJob> {
        debug!("spawning {}", command.join(" "));
        // Nothing reads pip's stdout while it runs; piping it could fill the
        // pipe and wedge the child. Diagnostics flow to stderr and the log.
        let child = Command::new(&command[0])
            .args(&command[1..])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env("PYTHONNOUSERSITE", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
            .spawn()
            .with_context(|| format!("failed to start {}", command.join(" ")))?;
        let job = Job::new(command, child).with_context("pip");
        Ok(LogScrapeJob::new(
            job,
            log_path.to_path_buf(),
            vec![Box::new(PipErrorAnalyzer::default())],
        ))
    }

    /// `pip download` all requirements for one target into `dest_dir`.
    pub fn spawn_download(
        &self,
        target: &Target,
        requirements: &[String],
        constraint_files: &[PathBuf],
        dest_dir: &Path,
        log_path: &Path,
        settings: &ResolverSettings,
    ) -> Result<LogScrapeJob> {
        let command = self.download_command(
            target,
            requirements,
            constraint_files,
            dest_dir,
            log_path,
            settings,
        );
        self.spawn(command, dest_dir, log_path)
    }

    fn download_command(
        &self,
        target: &Target,
        requirements: &[String],
        constraint_files: &[PathBuf],
        dest_dir: &Path,
        log_path: &Path,
        settings: &ResolverSettings,
    ) -> Vec<String> {
        let mut command = self.base_command(log_path);
        command.push("download".to_string());
        command.push("--dest".to_string());
        command.push(dest_dir.to_string_lossy().into_owned());
        if !settings.allow_builds {
            command.push("--only-binary".to_string());
            command.push(":all:".to_string());
        }
        if !settings.allow_wheels {
            command.push("--no-binary".to_string());
            command.push(":all:".to_string());
        }
        Self::push_index_args(&mut command, settings);
        Self::push_network_args(&mut command, &settings.network);
        Self::push_target_args(&mut command, target);
        for constraints in constraint_files {
            command.push("--constraint".to_string());
            command.push(constraints.to_string_lossy().into_owned());
        }
        command.extend(requirements.iter().cloned());
        command
    }

    /// `pip wheel` one source tree or archive into `wheel_dir`.
    pub fn spawn_build(
        &self,
        source_path: &Path,
        wheel_dir: &Path,
        log_path: &Path,
        settings: &ResolverSettings,
    ) -> Result<LogScrapeJob> {
        let mut command = self.base_command(log_path);
        command.push("wheel".to_string());
        command.push("--no-deps".to_string());
        command.push("--wheel-dir".to_string());
        command.push(wheel_dir.to_string_lossy().into_owned());
        Self::push_index_args(&mut command, settings);
        Self::push_network_args(&mut command, &settings.network);
        command.push(source_path.to_string_lossy().into_owned());
        self.spawn(command, wheel_dir, log_path)
    }

    /// `pip install` one wheel into a private chroot, dependencies excluded.
    pub fn spawn_install(
        &self,
        wheel_path: &Path,
        chroot: &Path,
        log_path: &Path,
    ) -> Result<LogScrapeJob> {
        let mut command = self.base_command(log_path);
        command.push("install".to_string());
        command.push("--no-deps".to_string());
        command.push("--no-compile".to_string());
        command.push("--target".to_string());
        command.push(chroot.to_string_lossy().into_owned());
        command.push(wheel_path.to_string_lossy().into_owned());
        self.spawn(command, chroot, log_path)
    }
}

/// Extracts `ERROR: ` lines from a pip log.
///
/// Pip writes one diagnostic per line; everything after the first error line
/// until the traceback tail tends to be relevant, so every matching line is
/// collected and the analyzer never completes early.
#[derive(Debug, Default)]
pub struct PipErrorAnalyzer;

impl LogAnalyzer for PipErrorAnalyzer {
    fn should_collect(&self, returncode: i32) -> bool {
        returncode != 0
    }

    fn analyze(&mut self, line: &str) -> Analysis {
        // Strip the timestamp prefix pip's log format carries.
        let trimmed = line.trim_start_matches(|ch: char| {
            ch.is_ascii_digit() || matches!(ch, '-' | ':' | ',' | '.' | 'T' | 'Z' | ' ')
        });
        if let Some(message) = trimmed.strip_prefix("ERROR: ") {
            Analysis::Continue(Some(ErrorMessage(message.to_string())))
        } else {
            Analysis::Continue(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_analyzer_collects_error_lines_only() {
        let mut analyzer = PipErrorAnalyzer::default();
        assert!(analyzer.should_collect(1));
        assert!(!analyzer.should_collect(0));

        let ignored = analyzer.analyze("Collecting ansicolors==1.1.8");
        assert!(matches!(ignored, Analysis::Continue(None)));

        // Pip log lines carry a timestamp prefix.
        let hit = analyzer.analyze(
            "2026-01-01T00:00:00,111 ERROR: No matching distribution found for nope==0.0.1",
        );
        match hit {
            Analysis::Continue(Some(ErrorMessage(message))) => {
                assert_eq!(message, "No matching distribution found for nope==0.0.1");
            }
            other => panic!("expected collected message, got {other:?}"),
        }
    }

    #[test]
    fn download_command_is_parser_clean_and_logged() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let pip = Pip::new(PathBuf::from("python3"));
        let target = Target::Abbreviated(pax_domain::AbbreviatedPlatform {
            platform_tag: "manylinux2014_x86_64".to_string(),
            python_version: Some("3.11".parse().map_err(|err| anyhow::anyhow!("{err}"))?),
        });
        let command = pip.download_command(
            &target,
            &["ansicolors==1.1.8".to_string()],
            &[],
            temp.path(),
            &temp.path().join("pip.log"),
            &ResolverSettings::default(),
        );
        assert!(command.contains(&"--log".to_string()));
        assert!(command.contains(&"download".to_string()));
        assert!(command.contains(&"ansicolors==1.1.8".to_string()));
        // A foreign target spells out its tags and forbids source builds.
        assert!(command.contains(&"--platform".to_string()));
        assert!(command.contains(&"--python-version".to_string()));
        assert!(command.contains(&"3.11".to_string()));
        assert!(command.contains(&"--only-binary".to_string()));
        Ok(())
    }

    #[test]
    fn network_settings_pass_through() {
        let temp = tempfile::tempdir().unwrap();
        let pip = Pip::new(PathBuf::from("python3"));
        let interpreter_target = Target::Abbreviated(pax_domain::AbbreviatedPlatform {
            platform_tag: "any".to_string(),
            python_version: None,
        });
        let settings = ResolverSettings {
            index_url: Some("https://pypi.internal/simple".to_string()),
            network: NetworkSettings {
                proxy: Some("http://proxy:3128".to_string()),
                trusted_hosts: vec!["pypi.internal".to_string()],
                ..NetworkSettings::default()
            },
            ..ResolverSettings::default()
        };
        let command = pip.download_command(
            &interpreter_target,
            &["demo".to_string()],
            &[],
            temp.path(),
            &temp.path().join("pip.log"),
            &settings,
        );
        assert!(command.contains(&"--index-url".to_string()));
        assert!(command.contains(&"--proxy".to_string()));
        assert!(command.contains(&"--trusted-host".to_string()));
        assert!(command.contains(&"pypi.internal".to_string()));
    }
}
