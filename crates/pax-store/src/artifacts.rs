use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use pax_domain::{hash_dir, Fingerprint, HashAlgorithm, ProjectName};
use pax_jobs::Job;
use reqwest::blocking::Client;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

use crate::{Downloadable, SavedArtifact};

const USER_AGENT: &str = concat!("pax-store/", env!("CARGO_PKG_VERSION"));
const DOWNLOAD_ATTEMPTS: usize = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const COPY_CHUNK: usize = 64 * 1024;

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")
}

/// A remote file addressed by URL with a known expected hash.
pub struct UrlArtifact {
    url: Url,
    filename: String,
    fingerprint: Fingerprint,
    verified: bool,
}

impl UrlArtifact {
    #[must_use]
    pub fn new(url: Url, filename: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            url,
            filename: filename.into(),
            fingerprint,
            verified: false,
        }
    }

    /// Mark the expected hash as asserted by a lock file, which shifts trust
    /// from the network to the lock and skips re-verification.
    #[must_use]
    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }

    fn download_once(&self, dest: &Path) -> Result<Fingerprint> {
        let client = http_client()?;
        let mut response = client
            .get(self.url.clone())
            .send()
            .with_context(|| format!("failed to fetch {}", self.url))?
            .error_for_status()
            .with_context(|| format!("unexpected response for {}", self.url))?;

        let mut file = File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut hasher = self.fingerprint.algorithm.new_hasher();
        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            let read = response
                .read(&mut chunk)
                .with_context(|| format!("stream error for {}", self.filename))?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
            file.write_all(&chunk[..read])?;
        }
        Ok(hasher.finish())
    }
}

impl Downloadable for UrlArtifact {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn already_verified(&self) -> bool {
        self.verified
    }

    fn save(&self, dest_dir: &Path, project_name: &ProjectName) -> Result<SavedArtifact> {
        let dest = dest_dir.join(&self.filename);
        let mut last_err = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self.download_once(&dest) {
                Ok(fingerprint) => {
                    debug!(project = %project_name, url = %self.url, "downloaded on attempt {attempt}");
                    return Ok(SavedArtifact {
                        filename: self.filename.clone(),
                        fingerprint,
                    });
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("failed to download {}", self.url)))
    }
}

/// A VCS checkout pinned to an immutable commit.
///
/// The cache key derives from the locator (URL + commit) rather than checkout
/// bytes: the commit id already pins content, and the key must be computable
/// before any fetch happens. The sidecar still records the content digest of
/// the checked-out tree.
pub struct VcsArtifact {
    repo_url: String,
    commit: String,
    fingerprint: Fingerprint,
}

impl VcsArtifact {
    #[must_use]
    pub fn new(repo_url: impl Into<String>, commit: impl Into<String>) -> Self {
        let repo_url = repo_url.into();
        let commit = commit.into();
        let mut hasher = HashAlgorithm::Sha256.new_hasher();
        hasher.update(format!("vcs:{repo_url}@{commit}").as_bytes());
        Self {
            fingerprint: hasher.finish(),
            repo_url,
            commit,
        }
    }

    fn run_git(&self, args: &[&str], cwd: &Path) -> Result<()> {
        let mut command = vec!["git".to_string()];
        command.extend(args.iter().map(ToString::to_string));
        let child = Command::new(&command[0])
            .args(&command[1..])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start git {}", args.join(" ")))?;
        let mut job = Job::new(command, child).with_context("git");
        job.wait().map_err(|err| anyhow!("{err}"))
    }
}

impl Downloadable for VcsArtifact {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn already_verified(&self) -> bool {
        // The commit id pins the content; there is no second hash to check.
        true
    }

    fn save(&self, dest_dir: &Path, project_name: &ProjectName) -> Result<SavedArtifact> {
        let checkout_name = project_name.as_str().to_string();
        let checkout = dest_dir.join(&checkout_name);
        self.run_git(
            &["clone", "--quiet", &self.repo_url, &checkout.to_string_lossy()],
            dest_dir,
        )?;
        self.run_git(
            &["-C", &checkout.to_string_lossy(), "checkout", "--quiet", &self.commit],
            dest_dir,
        )?;
        // Strip VCS bookkeeping so the artifact is pure project content and
        // its digest is timestamp- and remote-insensitive.
        let git_dir = checkout.join(".git");
        if git_dir.exists() {
            fs::remove_dir_all(&git_dir)
                .with_context(|| format!("failed to remove {}", git_dir.display()))?;
        }
        Ok(SavedArtifact {
            filename: checkout_name,
            fingerprint: hash_dir(self.fingerprint.algorithm, &checkout)?,
        })
    }
}

/// A single file already on the local filesystem, e.g. one an installer tool
/// just fetched into a staging directory.
pub struct LocalFileArtifact {
    source: PathBuf,
    filename: String,
    fingerprint: Fingerprint,
}

impl LocalFileArtifact {
    pub fn new(source: &Path) -> Result<Self> {
        let filename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no filename", source.display()))?;
        Ok(Self {
            source: source.to_path_buf(),
            filename,
            fingerprint: pax_domain::hash_file(HashAlgorithm::Sha256, source)?,
        })
    }
}

impl Downloadable for LocalFileArtifact {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn save(&self, dest_dir: &Path, _project_name: &ProjectName) -> Result<SavedArtifact> {
        let dest = dest_dir.join(&self.filename);
        fs::copy(&self.source, &dest)
            .with_context(|| format!("failed to copy {}", self.source.display()))?;
        Ok(SavedArtifact {
            filename: self.filename.clone(),
            fingerprint: pax_domain::hash_file(self.fingerprint.algorithm, &dest)?,
        })
    }
}

/// A project directory on the local filesystem.
pub struct LocalProjectArtifact {
    source: PathBuf,
    fingerprint: Fingerprint,
}

impl LocalProjectArtifact {
    /// Fingerprint the source tree up front; the digest is the cache key.
    pub fn new(source: &Path) -> Result<Self> {
        Ok(Self {
            source: source.to_path_buf(),
            fingerprint: hash_dir(HashAlgorithm::Sha256, source)?,
        })
    }
}

impl Downloadable for LocalProjectArtifact {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn save(&self, dest_dir: &Path, project_name: &ProjectName) -> Result<SavedArtifact> {
        let copy_name = project_name.as_str().to_string();
        let copy_root = dest_dir.join(&copy_name);
        copy_project_tree(&self.source, &copy_root)?;
        Ok(SavedArtifact {
            filename: copy_name,
            fingerprint: hash_dir(self.fingerprint.algorithm, &copy_root)?,
        })
    }
}

/// Copy a project tree, leaving bytecode caches behind so the copy hashes
/// identically to the source.
fn copy_project_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).into_iter().filter_entry(|entry| {
        entry
            .file_name()
            .to_str()
            .map_or(true, |name| name != "__pycache__")
    }) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} escaped its root", entry.path().display()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".pyc") || name.ends_with(".pyo") {
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    if !dest.exists() {
        bail!("local project {} produced an empty copy", source.display());
    }
    Ok(())
}
