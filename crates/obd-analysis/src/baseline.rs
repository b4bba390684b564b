//! Deterministic analysis from the reference catalog
//!
//! The baseline is always computed first. AI enrichment is merged over it but
//! never removes anything it contains, so every trouble code keeps at least
//! one diagnosis even when no provider answers.

use obd_core::{
    Diagnosis, DiagnosisSource, ReferenceCatalog, RepairSuggestion, SafetyWarning,
    SensorObservation, SensorReading, Severity, TroubleCode,
};

/// Confidence assigned to a catalog-backed diagnosis
const CATALOG_CONFIDENCE: f64 = 0.8;
/// Confidence assigned to a generic diagnosis for an unlisted code
const GENERIC_CONFIDENCE: f64 = 0.5;

const COOLANT_TEMP: u8 = 0x05;
const ENGINE_RPM: u8 = 0x0C;
const VEHICLE_SPEED: u8 = 0x0D;

const OVERHEAT_THRESHOLD_C: f64 = 100.0;
const HIGH_IDLE_RPM: f64 = 1000.0;
const STATIONARY_KMH: f64 = 5.0;

/// Catalog-derived diagnoses, repairs and warnings for one code set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baseline {
    /// Maximum over the code severities
    pub severity: Severity,
    pub diagnoses: Vec<Diagnosis>,
    pub diy_repairs: Vec<RepairSuggestion>,
    pub professional_repairs: Vec<RepairSuggestion>,
    pub safety_warnings: Vec<SafetyWarning>,
}

impl Baseline {
    /// One diagnosis per code, in the order the codes were read
    pub fn build(catalog: &ReferenceCatalog, codes: &[TroubleCode]) -> Self {
        let mut baseline = Baseline {
            severity: Severity::max_of(codes.iter().map(|c| c.severity)),
            ..Default::default()
        };

        for code in codes {
            let Some(entry) = catalog.lookup(&code.code) else {
                baseline.diagnoses.push(Diagnosis {
                    name: format!("{} - {}", code.code, code.description),
                    description: format!(
                        "{} is not in the reference catalog. A technician with manufacturer documentation can confirm what it means for this vehicle.",
                        code.code
                    ),
                    confidence: GENERIC_CONFIDENCE,
                    severity: code.severity,
                    codes: vec![code.code.clone()],
                    source: DiagnosisSource::Generic,
                    detail: None,
                });
                continue;
            };

            let name = entry.description.clone();
            let mut description = entry.description.clone();
            if !entry.likely_causes.is_empty() {
                description.push_str(". Likely causes: ");
                description.push_str(&entry.likely_causes.join(", "));
            }
            baseline.diagnoses.push(Diagnosis {
                name: name.clone(),
                description,
                confidence: CATALOG_CONFIDENCE,
                // The code carries the resolved severity, which may differ from
                // the entry when a user catalog was merged after reading
                severity: code.severity,
                codes: vec![code.code.clone()],
                source: DiagnosisSource::Catalog,
                detail: None,
            });

            if !entry.repair_steps.is_empty() {
                let repair = RepairSuggestion {
                    issue_name: name.clone(),
                    repair_name: format!("Repair {}", code.code),
                    description: entry.repair_steps.join(". "),
                    difficulty: entry.difficulty,
                    estimated_cost: entry.cost_range.clone(),
                    steps: entry.repair_steps.clone(),
                };
                if entry.diy {
                    baseline.diy_repairs.push(repair);
                } else {
                    baseline.professional_repairs.push(repair);
                }
            }

            if let Some(text) = &entry.safety_warning {
                push_warning(
                    &mut baseline.safety_warnings,
                    SafetyWarning {
                        text: text.clone(),
                        issue_name: Some(name),
                    },
                );
            }
        }

        baseline
    }
}

/// Add a warning unless one with the same text is already present
pub(crate) fn push_warning(warnings: &mut Vec<SafetyWarning>, warning: SafetyWarning) {
    let text = warning.text.trim();
    if text.is_empty() || warnings.iter().any(|w| w.text.trim().eq_ignore_ascii_case(text)) {
        return;
    }
    warnings.push(warning);
}

/// Notable values in a live sensor sample
pub fn observe_sensors(readings: &[SensorReading]) -> Vec<SensorObservation> {
    let value_of = |pid: u8| readings.iter().find(|r| r.pid == pid);
    let mut observations = Vec::new();

    if let Some(coolant) = value_of(COOLANT_TEMP) {
        if coolant.value > OVERHEAT_THRESHOLD_C {
            observations.push(SensorObservation {
                pid: coolant.pid,
                name: "Engine Overheating".to_string(),
                value: coolant.value,
                unit: coolant.unit.clone(),
                severity: Severity::High,
                message: format!(
                    "Coolant temperature is {:.0} {}, above the normal operating range",
                    coolant.value, coolant.unit
                ),
            });
        }
    }

    if let (Some(rpm), Some(speed)) = (value_of(ENGINE_RPM), value_of(VEHICLE_SPEED)) {
        if rpm.value > HIGH_IDLE_RPM && speed.value < STATIONARY_KMH {
            observations.push(SensorObservation {
                pid: rpm.pid,
                name: "High Idle RPM".to_string(),
                value: rpm.value,
                unit: rpm.unit.clone(),
                severity: Severity::Medium,
                message: format!(
                    "Engine speed is {:.0} {} while the vehicle is stationary",
                    rpm.value, rpm.unit
                ),
            });
        }
    }

    observations
}
