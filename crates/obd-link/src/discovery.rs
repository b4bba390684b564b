//! Adapter discovery
//!
//! Enumerates serial device nodes and configured WiFi adapters, probes each
//! candidate under a bounded timeout and returns them wired-first. A candidate
//! that cannot be probed is logged and skipped; finding nothing is not an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obd_core::{EndpointDescriptor, TransportKind};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::transport::SimulatedTransport;

/// Source of candidate endpoints
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Candidate endpoints, wired before wireless, most recently seen first
    async fn discover(&self) -> Vec<EndpointDescriptor>;
}

/// Discovery over the local device directory and configured TCP adapters
pub struct SystemDiscovery {
    config: DiscoveryConfig,
}

impl SystemDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    async fn probe_device(
        &self,
        path: PathBuf,
        kind: TransportKind,
        manufacturer: Option<String>,
    ) -> Option<EndpointDescriptor> {
        let address = path.display().to_string();
        let timeout = self.config.probe_timeout();
        // A blocking open cannot be aborted; non-blocking mode keeps it short
        let probe = tokio::task::spawn_blocking(move || probe_node(&path));

        let last_seen = match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(Ok(last_seen))) => last_seen,
            Ok(Ok(Err(e))) => {
                warn!(endpoint = %address, error = %e, "Skipping unreachable adapter");
                return None;
            }
            Ok(Err(e)) => {
                warn!(endpoint = %address, error = %e, "Probe task failed");
                return None;
            }
            Err(_) => {
                warn!(
                    endpoint = %address,
                    timeout_ms = timeout.as_millis() as u64,
                    "Skipping adapter that did not open in time"
                );
                return None;
            }
        };

        let label = match kind {
            TransportKind::Wired => "Serial adapter",
            TransportKind::Wireless => "Bluetooth adapter",
        };
        let mut endpoint = EndpointDescriptor::new(kind, address, label).with_last_seen(last_seen);
        if let Some(manufacturer) = manufacturer {
            endpoint = endpoint.with_manufacturer(manufacturer);
        }
        Some(endpoint)
    }

    async fn probe_host(&self, host: &str) -> Option<EndpointDescriptor> {
        let timeout = self.config.probe_timeout();
        match tokio::time::timeout(timeout, TcpStream::connect(host)).await {
            Ok(Ok(_)) => Some(
                EndpointDescriptor::new(TransportKind::Wireless, host, "WiFi adapter")
                    .with_last_seen(Utc::now()),
            ),
            Ok(Err(e)) => {
                warn!(endpoint = %host, error = %e, "Skipping unreachable adapter");
                None
            }
            Err(_) => {
                warn!(
                    endpoint = %host,
                    timeout_ms = timeout.as_millis() as u64,
                    "Skipping adapter that did not answer in time"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Discovery for SystemDiscovery {
    async fn discover(&self) -> Vec<EndpointDescriptor> {
        let config = self.config.clone();
        let scan = match tokio::task::spawn_blocking(move || DeviceScan::collect(&config)).await {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "Device enumeration task failed");
                DeviceScan::default()
            }
        };

        let mut found = Vec::new();
        for (path, kind) in scan.candidates {
            debug!(path = %path.display(), kind = %kind, "Probing device node");
            let manufacturer = scan.manufacturers.get(&path.display().to_string()).cloned();
            if let Some(endpoint) = self.probe_device(path, kind, manufacturer).await {
                found.push(endpoint);
            }
        }
        for host in &self.config.wireless_hosts {
            if let Some(endpoint) = self.probe_host(host).await {
                found.push(endpoint);
            }
        }

        let found = order_endpoints(found);
        info!(count = found.len(), "Adapter discovery complete");
        found
    }
}

/// Device nodes and USB metadata gathered in one blocking pass
#[derive(Debug, Default)]
struct DeviceScan {
    candidates: Vec<(PathBuf, TransportKind)>,
    /// Port name to USB manufacturer
    manufacturers: HashMap<String, String>,
}

impl DeviceScan {
    fn collect(config: &DiscoveryConfig) -> Self {
        Self {
            candidates: device_candidates(config),
            manufacturers: usb_manufacturers(),
        }
    }
}

/// Device nodes whose names match a configured prefix
fn device_candidates(config: &DiscoveryConfig) -> Vec<(PathBuf, TransportKind)> {
    let entries = match std::fs::read_dir(&config.device_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                dir = %config.device_dir.display(),
                error = %e,
                "Cannot list device directory"
            );
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(kind) = classify(config, &name) {
            candidates.push((entry.path(), kind));
        }
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates
}

fn classify(config: &DiscoveryConfig, name: &str) -> Option<TransportKind> {
    let matches = |prefixes: &[String]| prefixes.iter().any(|p| name.starts_with(p.as_str()));
    if matches(&config.wired_prefixes) {
        Some(TransportKind::Wired)
    } else if matches(&config.wireless_prefixes) {
        Some(TransportKind::Wireless)
    } else {
        None
    }
}

/// Open the node read-write without waiting for carrier and report its modification time
fn probe_node(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY);
    }
    let file = options.open(path)?;
    let modified = file.metadata()?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

#[cfg(feature = "serial")]
fn usb_manufacturers() -> HashMap<String, String> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!(error = %e, "Serial port metadata unavailable");
            return HashMap::new();
        }
    };
    ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => {
                usb.manufacturer.map(|m| (port.port_name, m))
            }
            _ => None,
        })
        .collect()
}

#[cfg(not(feature = "serial"))]
fn usb_manufacturers() -> HashMap<String, String> {
    HashMap::new()
}

/// Discovery that always reports the simulated adapter
#[derive(Debug, Default)]
pub struct SimulatedDiscovery;

#[async_trait]
impl Discovery for SimulatedDiscovery {
    async fn discover(&self) -> Vec<EndpointDescriptor> {
        vec![SimulatedTransport::endpoint()]
    }
}

/// Wired before wireless; within a kind, most recently seen first
pub fn order_endpoints(mut endpoints: Vec<EndpointDescriptor>) -> Vec<EndpointDescriptor> {
    endpoints.sort_by(|a, b| {
        kind_rank(a.kind)
            .cmp(&kind_rank(b.kind))
            .then_with(|| b.last_seen.cmp(&a.last_seen))
    });
    endpoints
}

fn kind_rank(kind: TransportKind) -> u8 {
    match kind {
        TransportKind::Wired => 0,
        TransportKind::Wireless => 1,
    }
}
