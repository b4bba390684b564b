//! WiFi ELM327 adapters over TCP

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::info;

use super::stream::StreamHandle;
use super::TransportError;

/// Connect to a WiFi adapter at `host:port`
pub async fn connect(
    address: &str,
    timeout: Duration,
) -> Result<StreamHandle<TcpStream>, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            TransportError::OpenFailed(format!(
                "connect to {} timed out after {} ms",
                address,
                timeout.as_millis()
            ))
        })?
        .map_err(|e| TransportError::OpenFailed(format!("{}: {}", address, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::OpenFailed(format!("{}: {}", address, e)))?;

    info!(address, "TCP adapter connected");
    Ok(StreamHandle::new(stream, address))
}
