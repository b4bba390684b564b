//! Ordinal severity rating

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity of a trouble code or diagnosis, ordered `none < low < medium < high < critical`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Maximum of a set of severities, `None` for an empty set
    pub fn max_of<I: IntoIterator<Item = Severity>>(iter: I) -> Severity {
        iter.into_iter().max().unwrap_or(Severity::None)
    }

    /// Whether this severity warrants a general safety warning
    pub fn is_serious(self) -> bool {
        self >= Severity::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    /// Case-insensitive; accepts the common synonyms produced by text generators
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "ok" | "unknown" => Ok(Severity::None),
            "low" | "minor" | "info" => Ok(Severity::Low),
            "medium" | "moderate" | "warning" => Ok(Severity::Medium),
            "high" | "severe" | "major" => Ok(Severity::High),
            "critical" | "urgent" => Ok(Severity::Critical),
            other => Err(format!("Unknown severity: {}", other)),
        }
    }
}
