//! Error taxonomy for diagnostic sessions

use thiserror::Error;

/// Result type for session-level operations
pub type DiagResult<T> = Result<T, DiagError>;

/// Errors surfaced by the diagnostic session pipeline
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DiagError {
    /// Link could not be established
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Adapter answered but no vehicle protocol could be resolved
    #[error("Protocol error on {endpoint}: {message}")]
    Protocol {
        /// Address of the endpoint that failed protocol detection
        endpoint: String,
        message: String,
    },

    /// A read/write/clear operation failed on a connected link
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    /// An AI enrichment call failed (absorbed by the analysis pipeline)
    #[error("AI provider error: {0}")]
    AiProvider(#[from] AiProviderError),

    /// A second concurrent session was requested for the same vehicle
    #[error("Vehicle {vehicle_id} already has an active session")]
    Conflict { vehicle_id: String },

    /// Unknown or already-ended session handle
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation not allowed in the current link state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// The session was ended while the operation was in flight
    #[error("Operation cancelled")]
    Cancelled,
}

impl DiagError {
    /// Whether the caller may retry the same operation on the same session
    pub fn is_retryable(&self) -> bool {
        match self {
            DiagError::Connection(e) => e.is_retryable(),
            DiagError::Acquisition(e) => e.is_retryable(),
            DiagError::AiProvider(_) => true,
            DiagError::Storage(_) => true,
            DiagError::Protocol { .. }
            | DiagError::Conflict { .. }
            | DiagError::SessionNotFound(_)
            | DiagError::InvalidState(_)
            | DiagError::Cancelled => false,
        }
    }

    /// Short machine-readable kind, used in logs and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            DiagError::Connection(_) => "connection",
            DiagError::Protocol { .. } => "protocol",
            DiagError::Acquisition(_) => "acquisition",
            DiagError::AiProvider(_) => "ai_provider",
            DiagError::Conflict { .. } => "conflict",
            DiagError::SessionNotFound(_) => "not_found",
            DiagError::InvalidState(_) => "invalid_state",
            DiagError::Storage(_) => "storage",
            DiagError::Cancelled => "cancelled",
        }
    }
}

/// Failures while opening or initializing a link
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("no diagnostic adapter found")]
    NoEndpoint,

    #[error("failed to open {endpoint}: {message}")]
    OpenFailed { endpoint: String, message: String },

    #[error("adapter on {endpoint} did not answer within {timeout_ms} ms")]
    HandshakeTimeout { endpoint: String, timeout_ms: u64 },

    #[error("link closed")]
    Closed,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::OpenFailed { .. } | ConnectionError::HandshakeTimeout { .. }
        )
    }
}

/// Failures of individual acquisition operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    #[error("{operation} failed: {message}")]
    Failed { operation: String, message: String },

    #[error("link is {state}, expected connected")]
    NotConnected { state: String },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl AcquisitionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Timeout { .. } | AcquisitionError::Failed { .. }
        )
    }

    pub fn failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AcquisitionError::Failed {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failures of an AI enrichment call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AiProviderError {
    #[error("{provider}: API key not configured")]
    MissingApiKey { provider: String },

    #[error("{provider}: authentication rejected")]
    Auth { provider: String },

    #[error("{provider}: rate limited")]
    RateLimited { provider: String },

    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    #[error("{provider}: no response within {timeout_ms} ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("{provider}: API error {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: unusable response: {message}")]
    InvalidResponse { provider: String, message: String },
}

impl AiProviderError {
    /// Name of the provider that produced this error
    pub fn provider(&self) -> &str {
        match self {
            AiProviderError::MissingApiKey { provider }
            | AiProviderError::Auth { provider }
            | AiProviderError::RateLimited { provider }
            | AiProviderError::Network { provider, .. }
            | AiProviderError::Timeout { provider, .. }
            | AiProviderError::Api { provider, .. }
            | AiProviderError::InvalidResponse { provider, .. } => provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = DiagError::from(AcquisitionError::Timeout {
            operation: "read_trouble_codes".into(),
            timeout_ms: 5000,
        });
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), "acquisition");

        let protocol = DiagError::Protocol {
            endpoint: "/dev/ttyUSB0".into(),
            message: "UNABLE TO CONNECT".into(),
        };
        assert!(!protocol.is_retryable());

        let conflict = DiagError::Conflict {
            vehicle_id: "car-1".into(),
        };
        assert!(!conflict.is_retryable());
        assert_eq!(conflict.to_string(), "Vehicle car-1 already has an active session");

        assert!(!DiagError::from(ConnectionError::NoEndpoint).is_retryable());
    }

    #[test]
    fn test_provider_name() {
        let err = AiProviderError::Timeout {
            provider: "anthropic".into(),
            timeout_ms: 100,
        };
        assert_eq!(err.provider(), "anthropic");
        assert_eq!(err.to_string(), "anthropic: no response within 100 ms");
    }
}
