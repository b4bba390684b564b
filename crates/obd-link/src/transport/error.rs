//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}
