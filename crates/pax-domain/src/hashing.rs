use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use walkdir::WalkDir;

const HASH_CHUNK: usize = 64 * 1024;

/// Directory and file names excluded from directory fingerprints. Bytecode
/// caches churn without any source change and would break reproducibility.
const EXCLUDED_DIRS: [&str; 1] = ["__pycache__"];
const EXCLUDED_SUFFIXES: [&str; 2] = [".pyc", ".pyo"];

/// Hash algorithms understood by the cache. The mapping from name to hasher
/// is static; unknown algorithm names fail at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    #[must_use]
    pub fn new_hasher(self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown hash algorithm '{0}'")]
pub struct UnknownAlgorithm(String);

/// Incremental hasher over a statically known algorithm set.
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Sha512(hasher) => hasher.update(bytes),
        }
    }

    #[must_use]
    pub fn finish(self) -> Fingerprint {
        match self {
            Self::Sha256(hasher) => Fingerprint {
                algorithm: HashAlgorithm::Sha256,
                hash: hex::encode(hasher.finalize()),
            },
            Self::Sha512(hasher) => Fingerprint {
                algorithm: HashAlgorithm::Sha512,
                hash: hex::encode(hasher.finalize()),
            },
        }
    }
}

/// A hex-encoded content digest used as a cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: HashAlgorithm,
    pub hash: String,
}

impl Fingerprint {
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, hash: String) -> Self {
        Self { algorithm, hash }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Fingerprint {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (algorithm, hash) = raw
            .split_once(':')
            .with_context(|| format!("fingerprint '{raw}' is missing an algorithm prefix"))?;
        Ok(Self {
            algorithm: algorithm.parse()?,
            hash: hash.to_string(),
        })
    }
}

/// Hash the contents of a single file.
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<Fingerprint> {
    let mut hasher = algorithm.new_hasher();
    stream_file(&mut hasher, path)?;
    Ok(hasher.finish())
}

/// Hash a directory tree by content.
///
/// The digest covers each regular file's root-relative path (always with `/`
/// separators) and bytes, visited in sorted order. Timestamps, permissions
/// and bytecode caches do not participate, so re-touching files or compiling
/// them leaves the fingerprint unchanged.
pub fn hash_dir(algorithm: HashAlgorithm, root: &Path) -> Result<Fingerprint> {
    let mut hasher = algorithm.new_hasher();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(true, |name| !EXCLUDED_DIRS.contains(&name))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escaped its root", entry.path().display()))?;
        let normalized = normalize_separators(relative);
        if EXCLUDED_SUFFIXES
            .iter()
            .any(|suffix| normalized.ends_with(suffix))
        {
            continue;
        }
        hasher.update(normalized.as_bytes());
        hasher.update(b"\0");
        stream_file(&mut hasher, entry.path())?;
        hasher.update(b"\0");
    }
    Ok(hasher.finish())
}

fn normalize_separators(relative: &Path) -> String {
    let mut normalized = String::new();
    for component in relative.components() {
        if !normalized.is_empty() {
            normalized.push('/');
        }
        normalized.push_str(&component.as_os_str().to_string_lossy());
    }
    normalized
}

fn stream_file(hasher: &mut Hasher, path: &Path) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut chunk = [0u8; HASH_CHUNK];
    loop {
        let read = file
            .read(&mut chunk)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(())
}
