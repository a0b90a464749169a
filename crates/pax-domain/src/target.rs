use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use pep440_rs::Version;
use serde::{Deserialize, Serialize};

/// Script run against a candidate interpreter to learn its identity. Output
/// is a single JSON object on stdout; anything else is an interrogation
/// failure.
const INTERROGATE: &str = r#"
import json, platform, sys, sysconfig
print(json.dumps({
    "version": platform.python_version(),
    "implementation": platform.python_implementation(),
    "platform_tag": sysconfig.get_platform().replace("-", "_").replace(".", "_"),
    "sys_platform": sys.platform,
}))
"#;

#[derive(Debug, Deserialize)]
struct InterpreterInfo {
    version: String,
    implementation: String,
    platform_tag: String,
    sys_platform: String,
}

/// A concrete local Python interpreter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpreter {
    pub python: PathBuf,
    pub version: Version,
    pub implementation: String,
    pub platform_tag: String,
    pub sys_platform: String,
}

impl Interpreter {
    /// Interrogate the interpreter at `python`.
    pub fn discover(python: &Path) -> Result<Self> {
        let output = Command::new(python)
            .arg("-c")
            .arg(INTERROGATE)
            .output()
            .with_context(|| format!("failed to run {}", python.display()))?;
        if !output.status.success() {
            bail!(
                "interpreter interrogation of {} exited with {}: {}",
                python.display(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let info: InterpreterInfo = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("unparseable interrogation output from {}", python.display()))?;
        let version: Version = info
            .version
            .parse()
            .map_err(|err| anyhow::anyhow!("bad interpreter version '{}': {err}", info.version))?;
        Ok(Self {
            python: python.to_path_buf(),
            version,
            implementation: info.implementation,
            platform_tag: info.platform_tag,
            sys_platform: info.sys_platform,
        })
    }

    /// Find and interrogate the default interpreter on `PATH`.
    pub fn discover_default() -> Result<Self> {
        let python = which::which("python3")
            .or_else(|_| which::which("python"))
            .context("no python interpreter found on PATH")?;
        Self::discover(&python)
    }

    /// PEP 425 style interpreter tag, e.g. `cp311`.
    #[must_use]
    pub fn python_tag(&self) -> String {
        let prefix = match self.implementation.as_str() {
            "CPython" => "cp",
            "PyPy" => "pp",
            _ => "py",
        };
        let release = self.version.release();
        let major = release.first().copied().unwrap_or(0);
        let minor = release.get(1).copied().unwrap_or(0);
        format!("{prefix}{major}{minor}")
    }
}

/// A platform description with only partial tag information.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbbreviatedPlatform {
    pub platform_tag: String,
    pub python_version: Option<Version>,
}

/// A fully specified foreign platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePlatform {
    pub python_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
    pub python_version: Version,
}

/// The runtime a resolve is performed for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Target {
    Local(Interpreter),
    Complete(CompletePlatform),
    Abbreviated(AbbreviatedPlatform),
}

impl Target {
    /// Stable identifier used to key per-target cache subdirectories.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Local(interpreter) => {
                format!("{}-{}", interpreter.python_tag(), interpreter.platform_tag)
            }
            Self::Complete(platform) => format!(
                "{}-{}-{}",
                platform.python_tag, platform.abi_tag, platform.platform_tag
            ),
            Self::Abbreviated(platform) => match &platform.python_version {
                Some(version) => format!("{}-{version}", platform.platform_tag),
                None => platform.platform_tag.clone(),
            },
        }
    }

    /// Whether this target describes anything other than the interpreter
    /// running the resolve.
    #[must_use]
    pub fn is_foreign(&self) -> bool {
        !matches!(self, Self::Local(_))
    }

    #[must_use]
    pub fn platform_tag(&self) -> &str {
        match self {
            Self::Local(interpreter) => &interpreter.platform_tag,
            Self::Complete(platform) => &platform.platform_tag,
            Self::Abbreviated(platform) => &platform.platform_tag,
        }
    }

    #[must_use]
    pub fn platform_family(&self) -> PlatformFamily {
        PlatformFamily::of_tag(self.platform_tag())
    }

    /// Requested interpreter version, when the target pins one.
    #[must_use]
    pub fn python_version(&self) -> Option<&Version> {
        match self {
            Self::Local(interpreter) => Some(&interpreter.version),
            Self::Complete(platform) => Some(&platform.python_version),
            Self::Abbreviated(platform) => platform.python_version.as_ref(),
        }
    }

    /// Check a built wheel's platform tag against this target.
    ///
    /// An abbreviated platform carries partial information only, so the check
    /// flags clear family mismatches (linux vs macosx vs win) and nothing
    /// finer; a usable wheel must never be rejected on a guess.
    pub fn check_wheel_platform(&self, wheel_platform_tag: &str) -> Result<(), WheelMismatch> {
        let target_family = self.platform_family();
        if matches!(target_family, PlatformFamily::Any | PlatformFamily::Other) {
            return Ok(());
        }
        let mut families = wheel_platform_tag.split('.').map(PlatformFamily::of_tag);
        if families.any(|family| {
            matches!(family, PlatformFamily::Any | PlatformFamily::Other) || family == target_family
        }) {
            return Ok(());
        }
        Err(WheelMismatch {
            wheel_platform_tag: wheel_platform_tag.to_string(),
            target_id: self.id(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// A built wheel whose compiled platform clearly cannot run on the target.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("wheel platform '{wheel_platform_tag}' is incompatible with target {target_id}")]
pub struct WheelMismatch {
    pub wheel_platform_tag: String,
    pub target_id: String,
}

/// Coarse platform families used for conservative compatibility checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformFamily {
    Linux,
    Macos,
    Windows,
    Any,
    Other,
}

impl PlatformFamily {
    #[must_use]
    pub fn of_tag(tag: &str) -> Self {
        if tag == "any" {
            Self::Any
        } else if tag.starts_with("linux")
            || tag.starts_with("manylinux")
            || tag.starts_with("musllinux")
        {
            Self::Linux
        } else if tag.starts_with("macosx") {
            Self::Macos
        } else if tag.starts_with("win") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_target() -> Target {
        Target::Abbreviated(AbbreviatedPlatform {
            platform_tag: "manylinux2014_x86_64".to_string(),
            python_version: None,
        })
    }

    #[test]
    fn family_classification() {
        assert_eq!(PlatformFamily::of_tag("manylinux1_x86_64"), PlatformFamily::Linux);
        assert_eq!(PlatformFamily::of_tag("musllinux_1_2_aarch64"), PlatformFamily::Linux);
        assert_eq!(PlatformFamily::of_tag("macosx_11_0_arm64"), PlatformFamily::Macos);
        assert_eq!(PlatformFamily::of_tag("win_amd64"), PlatformFamily::Windows);
        assert_eq!(PlatformFamily::of_tag("any"), PlatformFamily::Any);
    }

    #[test]
    fn clear_family_mismatch_is_flagged() {
        let err = linux_target()
            .check_wheel_platform("macosx_11_0_arm64")
            .unwrap_err();
        assert_eq!(err.wheel_platform_tag, "macosx_11_0_arm64");
    }

    #[test]
    fn pure_and_same_family_wheels_pass() {
        let target = linux_target();
        assert!(target.check_wheel_platform("any").is_ok());
        assert!(target.check_wheel_platform("linux_x86_64").is_ok());
        // Compressed tag sets pass when any member matches.
        assert!(target
            .check_wheel_platform("manylinux_2_17_x86_64.manylinux2014_x86_64")
            .is_ok());
    }

    #[test]
    fn abbreviated_target_never_rejects_on_abi_detail() {
        // Same family, different micro-architecture: conservatively accepted.
        assert!(linux_target().check_wheel_platform("manylinux1_i686").is_ok());
    }

    #[test]
    fn target_id_is_stable() {
        let target = Target::Complete(CompletePlatform {
            python_tag: "cp311".to_string(),
            abi_tag: "cp311".to_string(),
            platform_tag: "manylinux2014_x86_64".to_string(),
            python_version: "3.11.9".parse().unwrap(),
        });
        assert_eq!(target.id(), "cp311-cp311-manylinux2014_x86_64");
        assert!(target.is_foreign());
    }
}
