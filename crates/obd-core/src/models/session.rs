//! Diagnostic session record

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    AnalysisResult, EndpointDescriptor, SensorReading, Severity, TroubleCode, VehicleContext,
    VehicleInfo,
};

/// Opaque handle to an active session held by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub Uuid);

impl SessionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of one full scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSession {
    pub id: Uuid,
    pub vehicle: VehicleContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointDescriptor>,
    /// Detected protocol, "simulated" in simulation mode
    pub protocol: String,
    pub simulated: bool,
    #[serde(default)]
    pub vehicle_info: VehicleInfo,
    pub trouble_codes: Vec<TroubleCode>,
    pub sensor_readings: Vec<SensorReading>,
    /// Absent when the trouble-code read failed
    pub analysis: Option<AnalysisResult>,
    /// False only when trouble codes could not be read
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl DiagnosticSession {
    pub fn new(id: Uuid, vehicle: VehicleContext, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            vehicle,
            endpoint: None,
            protocol: String::new(),
            simulated: false,
            vehicle_info: VehicleInfo::default(),
            trouble_codes: Vec::new(),
            sensor_readings: Vec::new(),
            analysis: None,
            success: false,
            error: None,
            started_at,
            ended_at: None,
        }
    }

    /// Overall severity: max over the trouble codes and the analysis
    pub fn severity(&self) -> Severity {
        let codes = self.trouble_codes.iter().map(|c| c.severity);
        let analysis = self.analysis.iter().map(|a| a.severity);
        Severity::max_of(codes.chain(analysis))
    }

    pub fn is_complete(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Freeze the session; it is not modified after this point
    pub fn complete(mut self, success: bool, error: Option<String>) -> Self {
        self.success = success;
        self.error = error;
        self.ended_at = Some(Utc::now());
        self
    }
}

/// Outcome of a trouble-code clear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClearOutcome {
    /// The command succeeded and a re-read reports no active codes
    Cleared,
    /// The command was accepted but codes still report active
    VerificationFailed { remaining: Vec<String> },
    /// The command was accepted but the verifying re-read failed
    Unverified { reason: String },
}
