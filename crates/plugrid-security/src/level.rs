//! Security levels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use plugrid_core::{PluginError, PluginResult};

/// How strictly a plugin must be validated.
///
/// Levels form a total order; each level runs every check of the levels
/// below it. `Moderate` and `Permissive` are accepted as aliases for
/// `Standard` and `Basic` when parsing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// File integrity only.
    None,
    /// Plus metadata shape checks.
    #[serde(alias = "permissive")]
    Basic,
    /// Plus checksum verification.
    #[default]
    #[serde(alias = "moderate")]
    Standard,
    /// Plus permission and install-location policy.
    Strict,
    /// Everything, and the only level that admits dangerous sandbox
    /// permission combinations.
    Maximum,
}

impl SecurityLevel {
    /// Every level, weakest first.
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::Basic,
        Self::Standard,
        Self::Strict,
        Self::Maximum,
    ];

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Strict => "strict",
            Self::Maximum => "maximum",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = PluginError;

    fn from_str(s: &str) -> PluginResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "basic" | "permissive" => Ok(Self::Basic),
            "standard" | "moderate" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            "maximum" => Ok(Self::Maximum),
            other => Err(PluginError::invalid_argument(format!(
                "unknown security level: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_totally_ordered() {
        let mut previous = SecurityLevel::None;
        for level in SecurityLevel::ALL {
            assert!(level >= previous);
            previous = level;
        }
        assert!(SecurityLevel::Strict > SecurityLevel::Standard);
    }

    #[test]
    fn aliases_parse() {
        assert_eq!(
            "moderate".parse::<SecurityLevel>().unwrap(),
            SecurityLevel::Standard
        );
        assert_eq!(
            "permissive".parse::<SecurityLevel>().unwrap(),
            SecurityLevel::Basic
        );
        assert!("paranoid".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn serde_aliases() {
        let level: SecurityLevel = serde_json::from_str("\"moderate\"").unwrap();
        assert_eq!(level, SecurityLevel::Standard);
        assert_eq!(serde_json::to_string(&level).unwrap(), "\"standard\"");
    }
}
