//! Trouble code models

use serde::{Deserialize, Serialize};

use super::{SensorReading, Severity};

/// A trouble code read from the vehicle, resolved against the reference catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Five-character code, e.g. `P0301`
    pub code: String,
    /// Description from the catalog, or a generic one for unknown codes
    pub description: String,
    /// Resolved severity
    pub severity: Severity,
    /// Which trouble-code query reported it
    pub kind: CodeKind,
    /// Sensor snapshot recorded when the fault was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_frame: Option<Vec<SensorReading>>,
}

impl TroubleCode {
    pub fn system(&self) -> Option<CodeSystem> {
        CodeSystem::from_code(&self.code)
    }
}

/// Trouble code source query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    /// Confirmed, stored code (mode 03)
    #[default]
    Stored,
    /// Detected during the current or last drive cycle (mode 07)
    Pending,
    /// Emission-related code that survives a clear (mode 0A)
    Permanent,
}

/// Vehicle system named by the first character of a code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeSystem {
    /// P codes - engine and transmission
    Powertrain,
    /// C codes - ABS, suspension, steering
    Chassis,
    /// B codes - airbags, climate control, lighting
    Body,
    /// U codes - module communication
    Network,
}

impl CodeSystem {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.chars().next()?.to_ascii_uppercase() {
            'P' => Some(CodeSystem::Powertrain),
            'C' => Some(CodeSystem::Chassis),
            'B' => Some(CodeSystem::Body),
            'U' => Some(CodeSystem::Network),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            CodeSystem::Powertrain => 'P',
            CodeSystem::Chassis => 'C',
            CodeSystem::Body => 'B',
            CodeSystem::Network => 'U',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CodeSystem::Powertrain => "powertrain",
            CodeSystem::Chassis => "chassis",
            CodeSystem::Body => "body",
            CodeSystem::Network => "network communication",
        }
    }
}

/// Check the `[PCBU][0-3][0-9A-F]{3}` shape of a trouble code
pub fn is_valid_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 5
        && CodeSystem::from_code(code).is_some()
        && matches!(bytes[1], b'0'..=b'3')
        && bytes[2..].iter().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_validation() {
        assert!(is_valid_code("P0301"));
        assert!(is_valid_code("U0100"));
        assert!(is_valid_code("C12AB"));
        assert!(!is_valid_code("P4301"));
        assert!(!is_valid_code("X0301"));
        assert!(!is_valid_code("P030"));
    }

    #[test]
    fn test_code_system() {
        assert_eq!(CodeSystem::from_code("b1234"), Some(CodeSystem::Body));
        assert_eq!(CodeSystem::Network.letter(), 'U');
        assert_eq!(CodeSystem::from_code(""), None);
    }
}
