//! Link session management
//!
//! A [`LinkSession`] owns one adapter connection and walks it through the
//! states below. Acquisition runs only while the link is `Connected`, moving
//! it to `Acquiring` for the duration of each operation.

mod link;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use link::LinkSession;

/// Link session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    /// Opening the chosen endpoint
    Scanning,
    /// Endpoint open, waiting for the adapter to answer
    Connecting,
    /// Adapter initialized, resolving the vehicle protocol
    Handshaking,
    Connected,
    Acquiring,
    Closing,
    Closed,
    /// Connection or protocol failure; only `close` is accepted afterwards
    Faulted,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Idle
    }
}

impl LinkState {
    /// No further operations except release of the handle
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Faulted)
    }

    /// Whether acquisition may run in this state
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Acquiring)
    }

    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Idle, Scanning) => true,
            // Simulation mode: one synthetic step from idle
            (Idle, Connected) => true,
            (Scanning, Connecting) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Connected) => true,
            (Connected, Acquiring) | (Acquiring, Connected) => true,
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Faulted, _) => false,
            (_, Faulted) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Scanning => "scanning",
            LinkState::Connecting => "connecting",
            LinkState::Handshaking => "handshaking",
            LinkState::Connected => "connected",
            LinkState::Acquiring => "acquiring",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
            LinkState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
