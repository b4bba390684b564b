//! Analysis result models

use serde::{Deserialize, Serialize};

use super::Severity;

/// Where a diagnosis came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisSource {
    /// Reference catalog entry
    Catalog,
    /// Code missing from the catalog, described generically
    Generic,
    /// Produced by an AI provider
    Ai,
}

/// A ranked explanation of one or more trouble codes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub name: String,
    pub description: String,
    /// Always within `[0, 1]`
    pub confidence: f64,
    pub severity: Severity,
    /// Trouble codes this diagnosis accounts for
    #[serde(default)]
    pub codes: Vec<String>,
    pub source: DiagnosisSource,
    /// Additional explanation contributed by an AI provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Diagnosis {
    pub fn covers(&self, code: &str) -> bool {
        self.codes.iter().any(|c| c.eq_ignore_ascii_case(code))
    }
}

/// A DIY or professional repair suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSuggestion {
    /// Name of the diagnosis this repair addresses
    pub issue_name: String,
    pub repair_name: String,
    pub description: String,
    /// 1 (trivial) to 5 (expert)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u8>,
    /// Free-form cost range, e.g. "$20-$100"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyWarning {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_name: Option<String>,
}

/// Notable live-sensor value, reported alongside diagnoses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorObservation {
    pub pid: u8,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of the analysis pipeline for one diagnostic session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Maximum over the codes and diagnoses
    pub severity: Severity,
    /// Ordered most severe first, then by confidence
    pub diagnoses: Vec<Diagnosis>,
    pub diy_repairs: Vec<RepairSuggestion>,
    pub professional_repairs: Vec<RepairSuggestion>,
    pub safety_warnings: Vec<SafetyWarning>,
    #[serde(default)]
    pub observations: Vec<SensorObservation>,
    pub summary: String,
    /// Provider whose narrative was merged, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_by: Option<String>,
}

impl AnalysisResult {
    /// Result for a vehicle that reported no trouble codes
    pub fn no_issues(observations: Vec<SensorObservation>) -> Self {
        let mut summary = String::from(
            "No issues detected. The vehicle reported no stored, pending or permanent trouble codes.",
        );
        if !observations.is_empty() {
            summary.push_str(&format!(
                " {} sensor reading(s) are worth a look.",
                observations.len()
            ));
        }
        Self {
            severity: Severity::None,
            diagnoses: Vec::new(),
            diy_repairs: Vec::new(),
            professional_repairs: Vec::new(),
            safety_warnings: Vec::new(),
            observations,
            summary,
            enriched_by: None,
        }
    }

    /// Whether some diagnosis accounts for `code`
    pub fn covers_code(&self, code: &str) -> bool {
        self.diagnoses.iter().any(|d| d.covers(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_issues() {
        let result = AnalysisResult::no_issues(Vec::new());
        assert_eq!(result.severity, Severity::None);
        assert!(result.diagnoses.is_empty());
        assert!(!result.summary.is_empty());
        assert!(!result.covers_code("P0301"));
    }
}
