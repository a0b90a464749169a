use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolved location of the pax cache root.
///
/// Every mutable on-disk structure pax maintains lives under this directory;
/// subdirectories are content-addressed and individually locked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaxRoot {
    root: PathBuf,
}

impl PaxRoot {
    /// Resolve from `PAX_ROOT`, falling back to `~/.pax/store`.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os("PAX_ROOT") {
            return Ok(Self::at(PathBuf::from(root)));
        }
        let home = dirs_next::home_dir().context("failed to resolve HOME for the pax cache")?;
        Ok(Self::at(home.join(".pax").join("store")))
    }

    /// Use an explicit root, bypassing environment resolution.
    #[must_use]
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Raw downloaded artifacts, keyed by content fingerprint.
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    /// Wheels built from sdists, keyed by source fingerprint then target tag.
    #[must_use]
    pub fn built_wheels_dir(&self) -> PathBuf {
        self.root.join("built_wheels")
    }

    /// Unpacked wheel chroots, keyed by wheel fingerprint.
    #[must_use]
    pub fn installed_wheels_dir(&self) -> PathBuf {
        self.root.join("installed_wheels")
    }

    /// Scratch space for subprocess logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
