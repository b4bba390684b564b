//! Transport layer for ELM327 adapters
//!
//! This module provides transports for reaching an adapter:
//! - Serial ports (USB, RS-232, Bluetooth RFCOMM), behind the `serial` feature
//! - TCP sockets for WiFi adapters
//! - A simulated ELM327 for running without hardware
//!
//! A [`Transport`] opens an endpoint and hands back a [`TransportHandle`];
//! the link session only ever sees these two traits.
//!
//! # Example
//!
//! ```ignore
//! use obd_link::transport::create_transport;
//! use obd_link::LinkConfig;
//!
//! let transport = create_transport(&LinkConfig::simulated());
//! let mut handle = transport.open(&endpoint).await?;
//! handle.write(b"ATZ\r").await?;
//! let reply = handle.read(Duration::from_secs(2)).await?;
//! handle.close().await?;
//! ```

mod adapter;
pub mod error;
#[cfg(feature = "serial")]
pub mod serial;
pub mod simulated;
pub mod stream;
pub mod tcp;

pub use adapter::{Transport, TransportHandle};
pub use error::TransportError;
pub use simulated::{ClearBehavior, SimulatedTransport};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obd_core::EndpointDescriptor;
use tracing::debug;

use crate::config::LinkConfig;

/// Create the transport selected by configuration
pub fn create_transport(config: &LinkConfig) -> Arc<dyn Transport> {
    if config.simulation {
        Arc::new(SimulatedTransport::new(&config.simulator))
    } else {
        Arc::new(HardwareTransport::new(config))
    }
}

/// Opens serial device nodes and `host:port` sockets
pub struct HardwareTransport {
    baud_rate: u32,
    connect_timeout: Duration,
}

impl HardwareTransport {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            connect_timeout: config.timeouts.connect(),
        }
    }
}

/// Whether an address names a socket rather than a device node
pub fn is_socket_address(address: &str) -> bool {
    !address.starts_with('/') && address.rsplit_once(':').is_some_and(|(host, port)| {
        !host.is_empty() && port.parse::<u16>().is_ok()
    })
}

#[async_trait]
impl Transport for HardwareTransport {
    fn name(&self) -> &str {
        "hardware"
    }

    async fn open(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        if is_socket_address(&endpoint.address) {
            debug!(address = %endpoint.address, "Opening TCP adapter");
            let handle = tcp::connect(&endpoint.address, self.connect_timeout).await?;
            return Ok(Box::new(handle));
        }

        debug!(address = %endpoint.address, baud = self.baud_rate, "Opening serial adapter");
        #[cfg(feature = "serial")]
        return serial::open(&endpoint.address, self.baud_rate)
            .map(|handle| Box::new(handle) as Box<dyn TransportHandle>);

        #[cfg(not(feature = "serial"))]
        return Err(TransportError::Unsupported(
            "serial adapters require the 'serial' feature".to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_address_detection() {
        assert!(is_socket_address("192.168.0.10:35000"));
        assert!(is_socket_address("obdlink.local:23"));
        assert!(!is_socket_address("/dev/ttyUSB0"));
        assert!(!is_socket_address("COM3"));
        assert!(!is_socket_address(":35000"));
    }

    #[test]
    fn test_factory_selects_simulator() {
        let transport = create_transport(&LinkConfig::simulated());
        assert_eq!(transport.name(), "simulated");

        let transport = create_transport(&LinkConfig::default());
        assert_eq!(transport.name(), "hardware");
    }
}
