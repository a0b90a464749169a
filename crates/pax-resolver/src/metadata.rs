use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::Requirement;
use pax_domain::ProjectName;
use tracing::warn;

/// Core metadata read from an installed distribution's `.dist-info`.
///
/// Only the fields the pipeline consumes are modeled; everything else in the
/// METADATA headers is passed over.
#[derive(Clone, Debug)]
pub struct DistMetadata {
    pub name: ProjectName,
    pub version: Version,
    pub requires_dists: Vec<Requirement>,
    pub requires_python: Option<VersionSpecifiers>,
}

impl DistMetadata {
    /// Locate and parse the single `*.dist-info/METADATA` under an installed
    /// wheel chroot.
    pub fn from_install_chroot(chroot: &Path) -> Result<Self> {
        let mut dist_infos = Vec::new();
        for entry in fs::read_dir(chroot)
            .with_context(|| format!("failed to list {}", chroot.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(".dist-info"))
            {
                dist_infos.push(path);
            }
        }
        match dist_infos.len() {
            1 => Self::from_metadata_file(&dist_infos.remove(0).join("METADATA")),
            0 => bail!("no .dist-info directory under {}", chroot.display()),
            found => bail!(
                "expected exactly one .dist-info under {}, found {found}",
                chroot.display()
            ),
        }
    }

    /// Parse the RFC 822 style headers of a METADATA file.
    pub fn from_metadata_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut name = None;
        let mut version = None;
        let mut requires_dists = Vec::new();
        let mut requires_python = None;
        for line in contents.lines() {
            // Headers end at the first blank line; the body is the long
            // description.
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "Name" => name = Some(ProjectName::new(value)),
                "Version" => {
                    version = Some(Version::from_str(value).map_err(|err| {
                        anyhow::anyhow!("bad Version in {}: {err}", path.display())
                    })?);
                }
                "Requires-Dist" => match Requirement::from_str(value) {
                    Ok(requirement) => requires_dists.push(requirement),
                    Err(err) => {
                        warn!("skipping unparseable Requires-Dist '{value}': {err}");
                    }
                },
                "Requires-Python" => match VersionSpecifiers::from_str(value) {
                    Ok(specifiers) => requires_python = Some(specifiers),
                    Err(err) => {
                        warn!("skipping unparseable Requires-Python '{value}': {err}");
                    }
                },
                _ => {}
            }
        }
        Ok(Self {
            name: name.with_context(|| format!("{} has no Name header", path.display()))?,
            version: version
                .with_context(|| format!("{} has no Version header", path.display()))?,
            requires_dists,
            requires_python,
        })
    }

    /// Direct `file://` URL dependencies declared by this distribution.
    ///
    /// Some build backends emit sibling local paths here; those projects must
    /// themselves be built and installed before the resolve is complete.
    #[must_use]
    pub fn direct_file_dependencies(&self) -> Vec<(ProjectName, PathBuf)> {
        use pep508_rs::VersionOrUrl;

        let mut found = Vec::new();
        for requirement in &self.requires_dists {
            let Some(VersionOrUrl::Url(raw)) = requirement.version_or_url.as_ref() else {
                continue;
            };
            let Ok(parsed) = url::Url::parse(&raw.to_string()) else {
                continue;
            };
            if parsed.scheme() != "file" {
                continue;
            }
            let Ok(path) = parsed.to_file_path() else {
                warn!("ignoring unmappable file dependency url {parsed}");
                continue;
            };
            found.push((ProjectName::new(&requirement.name.to_string()), path));
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_metadata(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("METADATA");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_core_headers() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = write_metadata(
            temp.path(),
            "Metadata-Version: 2.1\n\
             Name: Demo.Pkg\n\
             Version: 1.2.3\n\
             Requires-Python: >=3.8\n\
             Requires-Dist: ansicolors (>=1.1)\n\
             Requires-Dist: extra-only ; extra == 'fancy'\n\
             \n\
             Requires-Dist: not-a-header-anymore\n",
        );
        let metadata = DistMetadata::from_metadata_file(&path)?;
        assert_eq!(metadata.name, ProjectName::new("demo-pkg"));
        assert_eq!(metadata.version.to_string(), "1.2.3");
        assert_eq!(metadata.requires_dists.len(), 2);
        assert_eq!(metadata.requires_python.unwrap().to_string(), ">=3.8");
        Ok(())
    }

    #[test]
    fn finds_direct_file_dependencies() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = write_metadata(
            temp.path(),
            "Name: parent\n\
             Version: 0.1\n\
             Requires-Dist: sibling @ file:///work/sibling\n\
             Requires-Dist: ansicolors (>=1.1)\n",
        );
        let metadata = DistMetadata::from_metadata_file(&path)?;
        let deps = metadata.direct_file_dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].0, ProjectName::new("sibling"));
        assert_eq!(deps[0].1, PathBuf::from("/work/sibling"));
        Ok(())
    }

    #[test]
    fn single_dist_info_is_required() -> Result<()> {
        let temp = tempfile::tempdir()?;
        assert!(DistMetadata::from_install_chroot(temp.path()).is_err());

        let info = temp.path().join("demo-1.0.dist-info");
        fs::create_dir(&info)?;
        write_metadata(&info, "Name: demo\nVersion: 1.0\n");
        let metadata = DistMetadata::from_install_chroot(temp.path())?;
        assert_eq!(metadata.name, ProjectName::new("demo"));

        fs::create_dir(temp.path().join("other-2.0.dist-info"))?;
        assert!(DistMetadata::from_install_chroot(temp.path()).is_err());
        Ok(())
    }
}
