//! Diagnostic adapter endpoints

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical link kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB or RS-232 serial adapter
    Wired,
    /// Bluetooth (RFCOMM) or WiFi adapter
    Wireless,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Wired => f.write_str("wired"),
            TransportKind::Wireless => f.write_str("wireless"),
        }
    }
}

/// A candidate adapter produced by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub kind: TransportKind,
    /// Device path (`/dev/ttyUSB0`) or socket address (`192.168.0.10:35000`)
    pub address: String,
    /// Human label
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// When the endpoint was last observed (device node mtime, probe time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl EndpointDescriptor {
    pub fn new(kind: TransportKind, address: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            label: label.into(),
            manufacturer: None,
            last_seen: None,
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = Some(last_seen);
        self
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.label, self.address, self.kind)
    }
}

/// Endpoint selection passed to `begin_session`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EndpointChoice {
    /// Run discovery and try candidates in order
    #[default]
    Auto,
    /// Use this endpoint only
    Explicit(EndpointDescriptor),
}
