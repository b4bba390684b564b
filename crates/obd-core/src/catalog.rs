//! Trouble-code reference catalog
//!
//! Static lookup of trouble code to description, severity and repair template.
//! The catalog is loaded once at start-up and shared read-only (behind an `Arc`)
//! by every session, so lookups take `&self` and never lock.
//!
//! The built-in table ships with the crate as TOML. A user file in the same
//! format can be merged over it; entries with the same code replace the
//! built-in ones.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{CodeSystem, Severity};

const BUILTIN_CATALOG: &str = include_str!("../data/catalog.toml");

/// Maximum results returned by [`ReferenceCatalog::search`]
const SEARCH_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid catalog: {0}")]
    Parse(String),
}

/// Reference data for one trouble code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub code: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub likely_causes: Vec<String>,
    #[serde(default)]
    pub symptoms: Vec<String>,
    /// Canonical repair steps, in order
    #[serde(default)]
    pub repair_steps: Vec<String>,
    /// 1 (trivial) to 5 (expert)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_range: Option<String>,
    /// Whether the repair is reasonable for an owner to attempt
    #[serde(default)]
    pub diy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_warning: Option<String>,
}

/// Generic repair suggested when nothing more specific applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRepair {
    pub repair_name: String,
    pub description: String,
    #[serde(default)]
    pub difficulty: Option<u8>,
    #[serde(default)]
    pub estimated_cost: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeneralSection {
    #[serde(default)]
    serious_warning: Option<String>,
    #[serde(default)]
    fallback_repair: Option<FallbackRepair>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    general: GeneralSection,
    #[serde(default)]
    entries: Vec<ReferenceEntry>,
}

/// A code resolved against the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCode {
    pub code: String,
    pub description: String,
    pub severity: Severity,
    /// False when the code is not in the catalog
    pub known: bool,
}

#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    entries: HashMap<String, ReferenceEntry>,
    serious_warning: Option<String>,
    fallback_repair: Option<FallbackRepair>,
    unknown_severity: Severity,
}

impl ReferenceCatalog {
    /// Catalog with the built-in entries
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    /// Parse a catalog from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let mut catalog = Self {
            entries: HashMap::new(),
            serious_warning: None,
            fallback_repair: None,
            unknown_severity: Severity::Medium,
        };
        catalog.apply(file);
        Ok(catalog)
    }

    /// Built-in catalog with a user file merged over it
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let mut catalog = Self::builtin()?;
        catalog.merge_file(path)?;
        Ok(catalog)
    }

    /// Merge entries from a TOML file, replacing entries with the same code
    pub fn merge_file(&mut self, path: &Path) -> Result<(), CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file: CatalogFile =
            toml::from_str(&content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let count = file.entries.len();
        self.apply(file);
        info!(path = %path.display(), entries = count, "Merged trouble-code catalog");
        Ok(())
    }

    /// Severity assigned to codes missing from the catalog (default `medium`)
    pub fn with_unknown_severity(mut self, severity: Severity) -> Self {
        self.unknown_severity = severity;
        self
    }

    fn apply(&mut self, file: CatalogFile) {
        if file.general.serious_warning.is_some() {
            self.serious_warning = file.general.serious_warning;
        }
        if file.general.fallback_repair.is_some() {
            self.fallback_repair = file.general.fallback_repair;
        }
        for mut entry in file.entries {
            entry.code = normalize(&entry.code);
            if self.entries.insert(entry.code.clone(), entry).is_some() {
                debug!("Catalog entry replaced");
            }
        }
    }

    pub fn lookup(&self, code: &str) -> Option<&ReferenceEntry> {
        self.entries.get(&normalize(code))
    }

    /// Description and severity for any code; unknown codes are never dropped
    pub fn resolve(&self, code: &str) -> ResolvedCode {
        let code = normalize(code);
        match self.entries.get(&code) {
            Some(entry) => ResolvedCode {
                description: entry.description.clone(),
                severity: entry.severity,
                known: true,
                code,
            },
            None => ResolvedCode {
                description: generic_description(&code),
                severity: self.unknown_severity,
                known: false,
                code,
            },
        }
    }

    pub fn unknown_severity(&self) -> Severity {
        self.unknown_severity
    }

    /// Case-insensitive match on code or description, ordered by code
    pub fn search(&self, query: &str) -> Vec<&ReferenceEntry> {
        let query = query.trim().to_ascii_uppercase();
        let mut hits: Vec<&ReferenceEntry> = self
            .entries
            .values()
            .filter(|e| {
                e.code.contains(&query) || e.description.to_ascii_uppercase().contains(&query)
            })
            .collect();
        hits.sort_by(|a, b| a.code.cmp(&b.code));
        hits.truncate(SEARCH_LIMIT);
        hits
    }

    pub fn by_severity(&self, severity: Severity) -> Vec<&ReferenceEntry> {
        let mut hits: Vec<&ReferenceEntry> = self
            .entries
            .values()
            .filter(|e| e.severity == severity)
            .collect();
        hits.sort_by(|a, b| a.code.cmp(&b.code));
        hits
    }

    /// General warning attached to results of `high` severity or above
    pub fn serious_warning(&self) -> Option<&str> {
        self.serious_warning.as_deref()
    }

    pub fn fallback_repair(&self) -> Option<&FallbackRepair> {
        self.fallback_repair.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn generic_description(code: &str) -> String {
    match CodeSystem::from_code(code) {
        Some(system) => format!(
            "Unlisted {} trouble code {}; consult manufacturer documentation",
            system.label(),
            code
        ),
        None => format!("Unrecognized trouble code {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_builtin_parses() {
        let catalog = ReferenceCatalog::builtin().unwrap();
        assert!(catalog.len() > 40);
        assert!(catalog.serious_warning().is_some());
        assert_eq!(
            catalog.fallback_repair().unwrap().estimated_cost.as_deref(),
            Some("$80-$150")
        );
    }

    #[test]
    fn test_builtin_severities() {
        let catalog = ReferenceCatalog::builtin().unwrap();
        assert_eq!(catalog.lookup("P0301").unwrap().severity, Severity::High);
        assert_eq!(catalog.lookup("p0420").unwrap().severity, Severity::Medium);
        assert_eq!(catalog.lookup("P0300").unwrap().severity, Severity::Critical);
        assert_eq!(catalog.lookup("P0442").unwrap().severity, Severity::Low);
    }

    #[test]
    fn test_unknown_code_resolution() {
        let catalog = ReferenceCatalog::builtin().unwrap();
        let resolved = catalog.resolve("P1234");
        assert!(!resolved.known);
        assert_eq!(resolved.severity, Severity::Medium);
        assert!(resolved.description.contains("powertrain"));

        let strict = catalog.with_unknown_severity(Severity::High);
        assert_eq!(strict.resolve("B1999").severity, Severity::High);
    }

    #[test]
    fn test_search_and_by_severity() {
        let catalog = ReferenceCatalog::builtin().unwrap();
        let hits = catalog.search("misfire");
        assert!(hits.iter().any(|e| e.code == "P0300"));
        assert!(hits.windows(2).all(|w| w[0].code <= w[1].code));

        let critical = catalog.by_severity(Severity::Critical);
        assert!(critical.iter().all(|e| e.severity == Severity::Critical));
        assert!(critical.iter().any(|e| e.code == "P0335"));
    }

    #[test]
    fn test_merge_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[entries]]
code = "p0420"
description = "Catalyst below threshold (fleet override)"
severity = "high"

[[entries]]
code = "P2096"
description = "Post Catalyst Fuel Trim System Too Lean"
severity = "low"
"#
        )
        .unwrap();

        let catalog = ReferenceCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.lookup("P0420").unwrap().severity, Severity::High);
        assert!(catalog.resolve("P2096").known);
        assert!(catalog.serious_warning().is_some());
    }

    #[test]
    fn test_invalid_catalog() {
        let err = ReferenceCatalog::from_toml_str("[[entries]]\ncode = 1").unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
    }
}
