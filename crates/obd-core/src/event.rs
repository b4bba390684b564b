//! Progress events emitted while a diagnostic session runs

use serde::{Deserialize, Serialize};

use crate::models::{EndpointDescriptor, SessionHandle, Severity};

/// Discrete progress notification for presentation layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Connecting {
        vehicle_id: String,
        endpoint: String,
    },
    ConnectionEstablished {
        session: SessionHandle,
        endpoint: EndpointDescriptor,
        protocol: String,
    },
    ConnectionFailed {
        vehicle_id: String,
        error: String,
    },
    CodesFound {
        session: SessionHandle,
        count: usize,
    },
    SensorsRead {
        session: SessionHandle,
        count: usize,
    },
    AnalysisStarted {
        session: SessionHandle,
    },
    AnalysisComplete {
        session: SessionHandle,
        severity: Severity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enriched_by: Option<String>,
    },
    SessionSaved {
        session: SessionHandle,
        record_id: String,
    },
    SessionClosed {
        session: SessionHandle,
    },
}

impl ProgressEvent {
    /// Session this event belongs to, when one exists yet
    pub fn session(&self) -> Option<SessionHandle> {
        match self {
            ProgressEvent::Connecting { .. } | ProgressEvent::ConnectionFailed { .. } => None,
            ProgressEvent::ConnectionEstablished { session, .. }
            | ProgressEvent::CodesFound { session, .. }
            | ProgressEvent::SensorsRead { session, .. }
            | ProgressEvent::AnalysisStarted { session }
            | ProgressEvent::AnalysisComplete { session, .. }
            | ProgressEvent::SessionSaved { session, .. }
            | ProgressEvent::SessionClosed { session } => Some(*session),
        }
    }
}
