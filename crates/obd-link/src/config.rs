//! Link configuration
//!
//! Timeouts, retry policy, protocol selection, discovery sources, the default
//! live-sensor set and the simulator fixture. Every field has a default so an
//! empty `[link]` table is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::elm::pid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Use the built-in ELM327 simulator instead of hardware
    #[serde(default)]
    pub simulation: bool,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// "auto" or an ELM327 protocol number ("1"-"9", "A"-"C")
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Attempts at resolving a vehicle protocol before giving up
    #[serde(default = "default_detect_attempts")]
    pub detect_attempts: u32,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            simulation: false,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            protocol: default_protocol(),
            detect_attempts: default_detect_attempts(),
            baud_rate: default_baud_rate(),
            discovery: DiscoveryConfig::default(),
            sensors: SensorConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Configuration for simulation mode with default fixtures
    pub fn simulated() -> Self {
        Self {
            simulation: true,
            ..Default::default()
        }
    }

    /// ELM327 `ATSP` argument for the configured protocol
    pub fn protocol_selector(&self) -> &str {
        if self.protocol.eq_ignore_ascii_case("auto") {
            "0"
        } else {
            self.protocol.as_str()
        }
    }
}

fn default_protocol() -> String {
    "auto".to_string()
}

fn default_detect_attempts() -> u32 {
    3
}

fn default_baud_rate() -> u32 {
    38400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Opening the serial port or socket
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Adapter reply to the initialization exchange
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    /// Each acquisition operation
    #[serde(default = "default_acquisition_ms")]
    pub acquisition_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            handshake_ms: default_handshake_ms(),
            acquisition_ms: default_acquisition_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn acquisition(&self) -> Duration {
        Duration::from_millis(self.acquisition_ms)
    }
}

fn default_connect_ms() -> u64 {
    3000
}

fn default_handshake_ms() -> u64 {
    3000
}

fn default_acquisition_ms() -> u64 {
    5000
}

/// Retry policy for opening an endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// First backoff delay; doubles on each further attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory scanned for serial device nodes
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    /// Device name prefixes treated as wired adapters
    #[serde(default = "default_wired_prefixes")]
    pub wired_prefixes: Vec<String>,
    /// Device name prefixes treated as wireless (Bluetooth) adapters
    #[serde(default = "default_wireless_prefixes")]
    pub wireless_prefixes: Vec<String>,
    /// WiFi adapters to probe, as `host:port`
    #[serde(default)]
    pub wireless_hosts: Vec<String>,
    /// Per-candidate probe bound
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_dir: default_device_dir(),
            wired_prefixes: default_wired_prefixes(),
            wireless_prefixes: default_wireless_prefixes(),
            wireless_hosts: Vec::new(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_wired_prefixes() -> Vec<String> {
    ["ttyUSB", "ttyACM", "cu.usbserial", "tty.usbserial"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_wireless_prefixes() -> Vec<String> {
    ["rfcomm", "tty.OBD", "cu.OBD"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_probe_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Parameters read by every live-data request
    #[serde(default = "default_pids")]
    pub default_pids: Vec<u8>,
    /// Values kept per parameter for trend labeling
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            default_pids: default_pids(),
            history_len: default_history_len(),
        }
    }
}

fn default_pids() -> Vec<u8> {
    pid::DEFAULT_SET.to_vec()
}

fn default_history_len() -> usize {
    10
}

/// Fixture data served by the ELM327 simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Stored trouble codes
    #[serde(default = "default_sim_codes")]
    pub stored_codes: Vec<String>,
    #[serde(default)]
    pub pending_codes: Vec<String>,
    #[serde(default)]
    pub permanent_codes: Vec<String>,
    #[serde(default = "default_sim_vin")]
    pub vin: String,
    /// Simulated adapter latency per command
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            stored_codes: default_sim_codes(),
            pending_codes: Vec::new(),
            permanent_codes: Vec::new(),
            vin: default_sim_vin(),
            latency_ms: 0,
        }
    }
}

fn default_sim_codes() -> Vec<String> {
    vec!["P0301".to_string(), "P0420".to_string()]
}

fn default_sim_vin() -> String {
    "1HGCM82633A004352".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_uses_defaults() {
        let config: LinkConfig = toml::from_str("").unwrap();
        assert!(!config.simulation);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.timeouts.handshake(), Duration::from_secs(3));
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.protocol_selector(), "0");
        assert!(config.sensors.default_pids.contains(&0x0C));
    }

    #[test]
    fn test_partial_override() {
        let config: LinkConfig = toml::from_str(
            r#"
simulation = true
protocol = "6"

[timeouts]
acquisition_ms = 1500

[discovery]
wireless_hosts = ["192.168.0.10:35000"]
"#,
        )
        .unwrap();
        assert!(config.simulation);
        assert_eq!(config.protocol_selector(), "6");
        assert_eq!(config.timeouts.acquisition_ms, 1500);
        assert_eq!(config.timeouts.connect_ms, 3000);
        assert_eq!(config.discovery.wireless_hosts.len(), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(250));
        assert_eq!(retry.backoff(2), Duration::from_millis(500));
        assert_eq!(retry.backoff(3), Duration::from_millis(1000));
    }
}
