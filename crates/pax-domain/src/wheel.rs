use std::path::Path;

use anyhow::{bail, Result};
use pep440_rs::Version;

use crate::ProjectName;

const SDIST_SUFFIXES: [&str; 4] = [".tar.gz", ".tar.bz2", ".tgz", ".zip"];

/// Parsed PEP 427 wheel filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WheelName {
    pub distribution: ProjectName,
    pub version: Version,
    pub build_tag: Option<String>,
    pub python_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
}

impl WheelName {
    /// Parse `{dist}-{version}(-{build})?-{python}-{abi}-{platform}.whl`.
    pub fn parse(filename: &str) -> Result<Self> {
        let Some(stem) = filename.strip_suffix(".whl") else {
            bail!("'{filename}' is not a wheel filename");
        };
        let parts: Vec<&str> = stem.split('-').collect();
        let build_tag = match parts.len() {
            5 => None,
            6 => Some(parts[2].to_string()),
            _ => bail!("wheel filename '{filename}' does not have 5 or 6 segments"),
        };
        let version: Version = parts[1]
            .parse()
            .map_err(|err| anyhow::anyhow!("bad version in wheel '{filename}': {err}"))?;
        Ok(Self {
            distribution: ProjectName::new(parts[0]),
            version,
            build_tag,
            python_tag: parts[parts.len() - 3].to_string(),
            abi_tag: parts[parts.len() - 2].to_string(),
            platform_tag: parts[parts.len() - 1].to_string(),
        })
    }
}

/// Parsed source distribution filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdistName {
    pub distribution: ProjectName,
    pub version: Version,
}

impl SdistName {
    pub fn parse(filename: &str) -> Result<Self> {
        let Some(stem) = SDIST_SUFFIXES
            .iter()
            .find_map(|suffix| filename.strip_suffix(suffix))
        else {
            bail!("'{filename}' is not an sdist filename");
        };
        let Some((name, version)) = stem.rsplit_once('-') else {
            bail!("sdist filename '{filename}' has no version segment");
        };
        let version: Version = version
            .parse()
            .map_err(|err| anyhow::anyhow!("bad version in sdist '{filename}': {err}"))?;
        Ok(Self {
            distribution: ProjectName::new(name),
            version,
        })
    }
}

/// Whether a downloaded file is a pre-built wheel.
#[must_use]
pub fn is_wheel_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "whl")
}

/// Whether a downloaded file looks like a source distribution archive.
#[must_use]
pub fn is_sdist_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| SDIST_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
}
