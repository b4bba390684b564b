//! Simulated ELM327 adapter and vehicle
//!
//! Answers the same command set as a real adapter with deterministic fixture
//! data, so the link session and acquisition run unchanged without hardware.
//! Test hooks inject the failure modes a real adapter exhibits.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obd_core::{EndpointDescriptor, TransportKind};
use parking_lot::Mutex;
use tracing::debug;

use super::{Transport, TransportError, TransportHandle};
use crate::config::SimulatorConfig;
use crate::elm::{dtc, info_type, mode, pid};

/// Address of the simulated endpoint
pub const SIMULATED_ADDRESS: &str = "sim://elm327";

/// How the simulated vehicle reacts to a clear request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearBehavior {
    /// Codes are erased
    #[default]
    Clears,
    /// The request is acknowledged but the codes stay active
    Ignored,
    /// The request is refused with a negative response
    Rejected,
}

struct SimVehicle {
    stored: Vec<String>,
    pending: Vec<String>,
    permanent: Vec<String>,
    vin: String,
    ecu_name: String,
    supported: BTreeSet<u8>,
    /// Vehicle bus answering
    present: bool,
    /// Adapter answering at all
    silent: bool,
    clear: ClearBehavior,
    stalled: HashSet<String>,
    reads: u32,
    /// ISO 9141-2 vehicle: the first request carries a `BUS INIT` line
    kline: bool,
    bus_initialized: bool,
}

impl SimVehicle {
    fn new(config: &SimulatorConfig) -> Self {
        let supported = pid::TABLE
            .iter()
            .map(|s| s.pid)
            .filter(|p| *p != pid::FUEL_PRESSURE)
            .collect();
        Self {
            stored: config.stored_codes.clone(),
            pending: config.pending_codes.clone(),
            permanent: config.permanent_codes.clone(),
            vin: config.vin.clone(),
            ecu_name: "ECM-EngineControl".to_string(),
            supported,
            present: true,
            silent: false,
            clear: ClearBehavior::default(),
            stalled: HashSet::new(),
            reads: 0,
            kline: false,
            bus_initialized: false,
        }
    }

    /// Reply text (without the prompt), `None` when the adapter stays silent
    fn respond(&mut self, command: &str) -> Option<String> {
        let command = command.trim().to_ascii_uppercase();
        if self.silent || self.stalled.contains(&command) {
            return None;
        }

        if let Some(at) = command.strip_prefix("AT") {
            return Some(match at {
                "Z" => "\r\rELM327 v1.5".to_string(),
                "DP" if self.present && self.kline => "AUTO, ISO 9141-2".to_string(),
                "DP" if self.present => "AUTO, ISO 15765-4 (CAN 11/500)".to_string(),
                "DP" => "AUTO".to_string(),
                "DPN" => "A6".to_string(),
                _ => "OK".to_string(),
            });
        }

        if !self.present {
            return Some("SEARCHING...\rUNABLE TO CONNECT".to_string());
        }

        let Ok(bytes) = hex::decode(&command) else {
            return Some("?".to_string());
        };
        let Some((&service, args)) = bytes.split_first() else {
            return Some("?".to_string());
        };

        let reply = self.service_reply(service, args);
        if self.kline && !self.bus_initialized {
            self.bus_initialized = true;
            return Some(format!("BUS INIT: ...OK\r{}", reply));
        }
        Some(reply)
    }

    fn service_reply(&mut self, service: u8, args: &[u8]) -> String {
        match service {
            mode::CURRENT_DATA => self.current_data(args),
            mode::FREEZE_FRAME => self.freeze_frame(args),
            mode::STORED_CODES => code_reply(service, &self.stored),
            mode::PENDING_CODES => code_reply(service, &self.pending),
            mode::PERMANENT_CODES => code_reply(service, &self.permanent),
            mode::CLEAR_CODES => match self.clear {
                ClearBehavior::Clears => {
                    self.stored.clear();
                    self.pending.clear();
                    "44".to_string()
                }
                ClearBehavior::Ignored => "44".to_string(),
                ClearBehavior::Rejected => "7F0422".to_string(),
            },
            mode::VEHICLE_INFO => match args.first() {
                Some(&info_type::VIN) => {
                    let mut payload = vec![0x49, info_type::VIN, 0x01];
                    payload.extend_from_slice(self.vin.as_bytes());
                    multi_frame(&payload)
                }
                Some(&info_type::ECU_NAME) => {
                    let mut payload = vec![0x49, info_type::ECU_NAME, 0x01];
                    payload.extend_from_slice(self.ecu_name.as_bytes());
                    payload.resize(3 + 20, 0);
                    multi_frame(&payload)
                }
                _ => "NO DATA".to_string(),
            },
            _ => "?".to_string(),
        }
    }

    fn current_data(&mut self, args: &[u8]) -> String {
        let Some(&requested) = args.first() else {
            return "?".to_string();
        };
        if pid::SUPPORT_RANGES.contains(&requested) {
            return match self.support_bitmap(requested) {
                Some(bitmap) => format!("41{:02X}{}", requested, hex::encode_upper(bitmap)),
                None => "NO DATA".to_string(),
            };
        }
        if !self.supported.contains(&requested) {
            return "NO DATA".to_string();
        }
        self.reads = self.reads.wrapping_add(1);
        format!(
            "41{:02X}{}",
            requested,
            hex::encode_upper(sample(requested, self.reads))
        )
    }

    fn freeze_frame(&self, args: &[u8]) -> String {
        let (Some(&requested), Some(&frame)) = (args.first(), args.get(1)) else {
            return "?".to_string();
        };
        let Some(trigger) = self.stored.first() else {
            return "NO DATA".to_string();
        };
        if requested == 0x02 {
            let [high, low] = dtc::encode(trigger).unwrap_or([0, 0]);
            return format!("4202{:02X}{:02X}{:02X}", frame, high, low);
        }
        if !self.supported.contains(&requested) {
            return "NO DATA".to_string();
        }
        let data = match requested {
            pid::COOLANT_TEMP => vec![95 + 40],
            pid::ENGINE_RPM => vec![0x0D, 0x48],
            other => sample(other, 0),
        };
        format!("42{:02X}{:02X}{}", requested, frame, hex::encode_upper(data))
    }

    fn support_bitmap(&self, base: u8) -> Option<[u8; 4]> {
        let in_range = |p: u8| p > base && (p as u16) <= base as u16 + 0x20;
        let beyond = self.supported.iter().any(|p| (*p as u16) > base as u16 + 0x20);
        if base != 0 && !self.supported.iter().any(|p| *p > base) {
            return None;
        }
        let mut bits: u32 = 0;
        for p in self.supported.iter().filter(|p| in_range(**p)) {
            bits |= 1 << (32 - (*p - base) as u32);
        }
        if beyond {
            bits |= 1;
        }
        Some(bits.to_be_bytes())
    }
}

/// Deterministic data bytes for a PID, varying slightly with the read count
fn sample(requested: u8, reads: u32) -> Vec<u8> {
    match requested {
        pid::ENGINE_RPM => {
            let rpm = 780 + (reads % 5) as u16 * 10;
            (rpm * 4).to_be_bytes().to_vec()
        }
        pid::COOLANT_TEMP => vec![(88 + reads.min(6)) as u8 + 40],
        pid::ENGINE_LOAD => vec![0x40],
        pid::THROTTLE_POSITION => vec![0x26],
        pid::SHORT_FUEL_TRIM_1 | pid::SHORT_FUEL_TRIM_2 => vec![0x82],
        pid::LONG_FUEL_TRIM_1 | pid::LONG_FUEL_TRIM_2 => vec![0x84],
        pid::FUEL_PRESSURE => vec![0x64],
        pid::INTAKE_PRESSURE => vec![0x23],
        pid::INTAKE_TEMP => vec![30 + 40],
        pid::VEHICLE_SPEED => vec![0x00],
        pid::TIMING_ADVANCE => vec![0x90],
        pid::MAF_RATE => vec![0x01, 0xF4],
        pid::RUN_TIME => (reads.wrapping_mul(2) as u16).to_be_bytes().to_vec(),
        pid::MODULE_VOLTAGE => 14_100u16.to_be_bytes().to_vec(),
        _ => vec![0x00],
    }
}

/// CAN-style code reply: count byte then two bytes per code
fn code_reply(service: u8, codes: &[String]) -> String {
    let encoded: Vec<[u8; 2]> = codes.iter().filter_map(|c| dtc::encode(c)).collect();
    let mut reply = format!("{:02X}{:02X}", mode::response(service), encoded.len());
    for [high, low] in encoded {
        reply.push_str(&format!("{:02X}{:02X}", high, low));
    }
    reply
}

/// ISO-TP style multi-frame reply: byte-count header, then indexed frames
fn multi_frame(payload: &[u8]) -> String {
    let mut lines = vec![format!("{:03X}", payload.len())];
    let (first, rest) = payload.split_at(payload.len().min(6));
    lines.push(format!("0:{}", hex::encode_upper(first)));
    for (index, chunk) in rest.chunks(7).enumerate() {
        lines.push(format!("{:X}:{}", (index + 1) % 16, hex::encode_upper(chunk)));
    }
    lines.join("\r")
}

/// Transport that opens simulated ELM327 adapters sharing one vehicle
pub struct SimulatedTransport {
    vehicle: Arc<Mutex<SimVehicle>>,
    latency: Duration,
    failing_opens: AtomicU32,
    opens: AtomicU32,
    closes: Arc<AtomicU32>,
}

impl SimulatedTransport {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            vehicle: Arc::new(Mutex::new(SimVehicle::new(config))),
            latency: Duration::from_millis(config.latency_ms),
            failing_opens: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            closes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The endpoint discovery reports in simulation mode
    pub fn endpoint() -> EndpointDescriptor {
        EndpointDescriptor::new(TransportKind::Wired, SIMULATED_ADDRESS, "Simulated ELM327")
            .with_manufacturer("obdd")
    }

    /// Adapter never answers (handshake timeout)
    pub fn set_silent(&self, silent: bool) {
        self.vehicle.lock().silent = silent;
    }

    /// Vehicle bus answers protocol detection
    pub fn set_vehicle_present(&self, present: bool) {
        self.vehicle.lock().present = present;
    }

    /// Fail the next `count` open attempts
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn set_clear_behavior(&self, behavior: ClearBehavior) {
        self.vehicle.lock().clear = behavior;
    }

    /// Never answer `command`
    pub fn stall_command(&self, command: &str) {
        self.vehicle
            .lock()
            .stalled
            .insert(command.trim().to_ascii_uppercase());
    }

    pub fn set_stored_codes(&self, codes: Vec<String>) {
        self.vehicle.lock().stored = codes;
    }

    /// Answer like an ISO 9141-2 (K-line) vehicle
    pub fn set_kline(&self, kline: bool) {
        let mut vehicle = self.vehicle.lock();
        vehicle.kline = kline;
        vehicle.bus_initialized = false;
    }

    pub fn set_unsupported(&self, requested: u8) {
        self.vehicle.lock().supported.remove(&requested);
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of handles actually released
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn open(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::OpenFailed(format!(
                "{}: device busy",
                endpoint.address
            )));
        }
        debug!(address = %endpoint.address, "Simulated adapter opened");
        Ok(Box::new(SimulatedHandle {
            vehicle: self.vehicle.clone(),
            latency: self.latency,
            replies: VecDeque::new(),
            open: true,
            closes: self.closes.clone(),
        }))
    }
}

struct SimulatedHandle {
    vehicle: Arc<Mutex<SimVehicle>>,
    latency: Duration,
    replies: VecDeque<Vec<u8>>,
    open: bool,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl TransportHandle for SimulatedHandle {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        let command = String::from_utf8_lossy(bytes);
        if let Some(reply) = self.vehicle.lock().respond(&command) {
            self.replies.push_back(format!("{}\r\r>", reply).into_bytes());
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        if self.latency >= timeout || self.replies.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(format!(
                "no prompt from simulated adapter within {} ms",
                timeout.as_millis()
            )));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.replies
            .pop_front()
            .ok_or_else(|| TransportError::ReadFailed("reply queue empty".to_string()))
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.replies.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            self.replies.clear();
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
