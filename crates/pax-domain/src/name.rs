use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A PEP 503 normalized distribution name.
///
/// Runs of `-`, `_` and `.` collapse to a single `-` and the result is
/// lowercased, so `Foo.Bar__baz` and `foo-bar-baz` compare equal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    #[must_use]
    pub fn new(raw: &str) -> Self {
        let mut normalized = String::with_capacity(raw.len());
        let mut pending_separator = false;
        for ch in raw.chars() {
            if matches!(ch, '-' | '_' | '.') {
                pending_separator = !normalized.is_empty();
            } else {
                if pending_separator {
                    normalized.push('-');
                    pending_separator = false;
                }
                normalized.extend(ch.to_lowercase());
            }
        }
        Self(normalized)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectName {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(raw))
    }
}

impl From<&str> for ProjectName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separator_runs_and_case() {
        assert_eq!(ProjectName::new("Foo.Bar__baz").as_str(), "foo-bar-baz");
        assert_eq!(ProjectName::new("ansicolors"), ProjectName::new("AnsiColors"));
        assert_eq!(ProjectName::new("zope.interface").as_str(), "zope-interface");
    }

    #[test]
    fn trailing_and_leading_separators_do_not_dangle() {
        assert_eq!(ProjectName::new("-foo-").as_str(), "foo");
        assert_eq!(ProjectName::new("__init__").as_str(), "init");
    }
}
