//! Semantic versions and version ranges.
//!
//! Plugin versions follow SemVer: `major.minor.patch` with optional
//! pre-release and build-metadata suffixes. Ordering is total; build
//! metadata is ignored when comparing, pre-release versions sort before
//! the corresponding release.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version - breaking changes.
    pub major: u64,
    /// Minor version - backwards-compatible features.
    pub minor: u64,
    /// Patch version - backwards-compatible fixes.
    pub patch: u64,
    /// Optional pre-release identifier (the part after `-`).
    pub pre_release: Option<String>,
    /// Optional build metadata (the part after `+`). Ignored in ordering.
    pub build: Option<String>,
}

impl Version {
    /// Create a release version with no pre-release or build suffix.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }

    /// Attach a pre-release identifier.
    #[must_use]
    pub fn with_pre_release(mut self, pre: impl Into<String>) -> Self {
        self.pre_release = Some(pre.into());
        self
    }

    /// Attach build metadata.
    #[must_use]
    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// Compatibility predicate: same major version and not older than
    /// `required`.
    #[must_use]
    pub fn compatible_with(&self, required: &Self) -> bool {
        self.major == required.major && self >= required
    }

    /// Parse a version from a string like `1.2.3`, `1.2.3-beta.1`, or
    /// `1.2.3+build.42`.
    pub fn parse(s: &str) -> PluginResult<Self> {
        s.parse()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                // A pre-release sorts before the corresponding release.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl FromStr for Version {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (s, build) = match s.split_once('+') {
            Some((head, build)) if !build.is_empty() => (head, Some(build.to_string())),
            Some(_) => {
                return Err(PluginError::invalid_format(format!(
                    "empty build metadata in version: {s}"
                )));
            },
            None => (s, None),
        };
        let (s, pre) = match s.split_once('-') {
            Some((head, pre)) if !pre.is_empty() => (head, Some(pre.to_string())),
            Some(_) => {
                return Err(PluginError::invalid_format(format!(
                    "empty pre-release in version: {s}"
                )));
            },
            None => (s, None),
        };

        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(PluginError::invalid_format(format!(
                "invalid version (expected major.minor.patch): {s}"
            )));
        }
        let parse_num = |part: &str| {
            part.parse::<u64>().map_err(|e| {
                PluginError::invalid_format(format!("invalid version number '{part}': {e}"))
            })
        };
        Ok(Self {
            major: parse_num(parts[0])?,
            minor: parse_num(parts[1])?,
            patch: parse_num(parts[2])?,
            pre_release: pre,
            build,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A constraint over [`Version`] used by plugin dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRange {
    /// Any version satisfies the range.
    Any,
    /// Exactly this version.
    Exact(Version),
    /// This version or newer (any major).
    AtLeast(Version),
    /// SemVer-compatible with this version (same major, not older).
    Compatible(Version),
}

impl VersionRange {
    /// Whether `version` satisfies this range.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => version == v,
            Self::AtLeast(v) => version >= v,
            Self::Compatible(v) => version.compatible_with(v),
        }
    }

    /// Parse a range: `*`, `1.2.3`, `>=1.2.3`, or `^1.2.3`.
    pub fn parse(s: &str) -> PluginResult<Self> {
        let s = s.trim();
        if s == "*" || s.is_empty() {
            return Ok(Self::Any);
        }
        if let Some(rest) = s.strip_prefix(">=") {
            return Ok(Self::AtLeast(rest.trim().parse()?));
        }
        if let Some(rest) = s.strip_prefix('^') {
            return Ok(Self::Compatible(rest.parse()?));
        }
        Ok(Self::Exact(s.parse()?))
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::Any
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::AtLeast(v) => write!(f, ">={v}"),
            Self::Compatible(v) => write!(f, "^{v}"),
        }
    }
}

impl Serialize for VersionRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
