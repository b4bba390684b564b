//! obd-link - ELM327 link layer for OBD-II diagnostics
//!
//! This crate provides:
//! - Transport adapters (serial, TCP, simulated) behind one trait
//! - Adapter discovery with wired-first ordering
//! - The link session state machine (open, handshake, protocol detection, close)
//! - Acquisition of trouble codes, freeze frames and live sensor data

pub mod acquisition;
pub mod config;
pub mod discovery;
pub mod elm;
pub mod session;
pub mod transport;

pub use acquisition::Acquisition;
pub use config::LinkConfig;
pub use discovery::{Discovery, SimulatedDiscovery, SystemDiscovery};
pub use session::{LinkSession, LinkState};
pub use transport::{create_transport, Transport, TransportError, TransportHandle};
