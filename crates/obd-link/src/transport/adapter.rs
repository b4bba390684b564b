//! Transport traits

use std::time::Duration;

use async_trait::async_trait;
use obd_core::EndpointDescriptor;

use super::TransportError;

/// Opens endpoints of one transport family
///
/// Real hardware and the simulator both implement this, so the link session
/// runs the same code regardless of mode.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Open the endpoint at the transport level (port opened, socket connected)
    async fn open(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// An open byte channel to an ELM327 adapter
#[async_trait]
pub trait TransportHandle: Send {
    /// Write raw bytes (a `\r`-terminated command)
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read one reply, up to and including the `>` prompt
    ///
    /// Returns `TransportError::Timeout` if no complete reply arrives in time.
    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drop any buffered or late-arriving bytes before the next command
    async fn discard_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the underlying handle; calling it again is a no-op
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
