//! Serial ELM327 adapters (USB, RS-232, Bluetooth RFCOMM)

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use super::stream::StreamHandle;
use super::TransportError;

/// Open a serial adapter at 8N1 with the given baud rate
pub fn open(path: &str, baud_rate: u32) -> Result<StreamHandle<SerialStream>, TransportError> {
    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .map_err(|e| TransportError::OpenFailed(format!("{}: {}", path, e)))?;

    info!(path, baud_rate, "Serial adapter opened");
    Ok(StreamHandle::new(port, path))
}
