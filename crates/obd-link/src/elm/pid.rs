//! Mode 01/02 parameter identifiers and their decoding formulas

/// Decoding rule for one parameter
#[derive(Debug, Clone, Copy)]
pub struct PidSpec {
    pub pid: u8,
    pub name: &'static str,
    pub unit: &'static str,
    /// Data bytes the formula consumes
    pub bytes: usize,
    decode: fn(&[u8]) -> f64,
}

impl PidSpec {
    /// Decode the data bytes following `41 <pid>`; `None` when the reply is short
    pub fn decode(&self, data: &[u8]) -> Option<f64> {
        if data.len() < self.bytes {
            return None;
        }
        Some((self.decode)(&data[..self.bytes]))
    }
}

pub const ENGINE_LOAD: u8 = 0x04;
pub const COOLANT_TEMP: u8 = 0x05;
pub const SHORT_FUEL_TRIM_1: u8 = 0x06;
pub const LONG_FUEL_TRIM_1: u8 = 0x07;
pub const SHORT_FUEL_TRIM_2: u8 = 0x08;
pub const LONG_FUEL_TRIM_2: u8 = 0x09;
pub const FUEL_PRESSURE: u8 = 0x0A;
pub const INTAKE_PRESSURE: u8 = 0x0B;
pub const ENGINE_RPM: u8 = 0x0C;
pub const VEHICLE_SPEED: u8 = 0x0D;
pub const TIMING_ADVANCE: u8 = 0x0E;
pub const INTAKE_TEMP: u8 = 0x0F;
pub const MAF_RATE: u8 = 0x10;
pub const THROTTLE_POSITION: u8 = 0x11;
pub const RUN_TIME: u8 = 0x1F;
pub const MODULE_VOLTAGE: u8 = 0x42;

/// Parameters read when the caller names no others
pub const DEFAULT_SET: [u8; 12] = [
    ENGINE_RPM,
    COOLANT_TEMP,
    ENGINE_LOAD,
    THROTTLE_POSITION,
    SHORT_FUEL_TRIM_1,
    LONG_FUEL_TRIM_1,
    SHORT_FUEL_TRIM_2,
    LONG_FUEL_TRIM_2,
    INTAKE_PRESSURE,
    INTAKE_TEMP,
    FUEL_PRESSURE,
    MODULE_VOLTAGE,
];

fn percent(d: &[u8]) -> f64 {
    d[0] as f64 * 100.0 / 255.0
}

fn celsius(d: &[u8]) -> f64 {
    d[0] as f64 - 40.0
}

fn fuel_trim(d: &[u8]) -> f64 {
    (d[0] as f64 - 128.0) * 100.0 / 128.0
}

fn fuel_pressure(d: &[u8]) -> f64 {
    d[0] as f64 * 3.0
}

fn single(d: &[u8]) -> f64 {
    d[0] as f64
}

fn word(d: &[u8]) -> f64 {
    (d[0] as u16 * 256 + d[1] as u16) as f64
}

fn rpm(d: &[u8]) -> f64 {
    word(d) / 4.0
}

fn timing(d: &[u8]) -> f64 {
    d[0] as f64 / 2.0 - 64.0
}

fn maf(d: &[u8]) -> f64 {
    word(d) / 100.0
}

fn volts(d: &[u8]) -> f64 {
    word(d) / 1000.0
}

pub const TABLE: &[PidSpec] = &[
    PidSpec { pid: ENGINE_LOAD, name: "Engine Load", unit: "%", bytes: 1, decode: percent },
    PidSpec { pid: COOLANT_TEMP, name: "Coolant Temperature", unit: "°C", bytes: 1, decode: celsius },
    PidSpec { pid: SHORT_FUEL_TRIM_1, name: "Short Term Fuel Trim Bank 1", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: LONG_FUEL_TRIM_1, name: "Long Term Fuel Trim Bank 1", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: SHORT_FUEL_TRIM_2, name: "Short Term Fuel Trim Bank 2", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: LONG_FUEL_TRIM_2, name: "Long Term Fuel Trim Bank 2", unit: "%", bytes: 1, decode: fuel_trim },
    PidSpec { pid: FUEL_PRESSURE, name: "Fuel Pressure", unit: "kPa", bytes: 1, decode: fuel_pressure },
    PidSpec { pid: INTAKE_PRESSURE, name: "Intake Manifold Pressure", unit: "kPa", bytes: 1, decode: single },
    PidSpec { pid: ENGINE_RPM, name: "Engine RPM", unit: "rpm", bytes: 2, decode: rpm },
    PidSpec { pid: VEHICLE_SPEED, name: "Vehicle Speed", unit: "km/h", bytes: 1, decode: single },
    PidSpec { pid: TIMING_ADVANCE, name: "Timing Advance", unit: "°", bytes: 1, decode: timing },
    PidSpec { pid: INTAKE_TEMP, name: "Intake Air Temperature", unit: "°C", bytes: 1, decode: celsius },
    PidSpec { pid: MAF_RATE, name: "MAF Air Flow Rate", unit: "g/s", bytes: 2, decode: maf },
    PidSpec { pid: THROTTLE_POSITION, name: "Throttle Position", unit: "%", bytes: 1, decode: percent },
    PidSpec { pid: RUN_TIME, name: "Run Time Since Engine Start", unit: "s", bytes: 2, decode: word },
    PidSpec { pid: MODULE_VOLTAGE, name: "Battery Voltage", unit: "V", bytes: 2, decode: volts },
];

pub fn spec(pid: u8) -> Option<&'static PidSpec> {
    TABLE.iter().find(|s| s.pid == pid)
}

/// Supported-PID bitmap requests: `0100`, `0120`, `0140`, ...
pub const SUPPORT_RANGES: [u8; 8] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0, 0xE0];

/// PIDs flagged in a 4-byte support bitmap starting after `base`
///
/// Bit 7 of the first byte is `base + 1`; the last bit (`base + 0x20`) also
/// announces whether the next range can be queried.
pub fn parse_support_bitmap(base: u8, bitmap: &[u8]) -> Vec<u8> {
    let mut pids = Vec::new();
    for (byte_index, byte) in bitmap.iter().take(4).enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                let offset = (byte_index * 8 + bit + 1) as u16;
                if let Ok(pid) = u8::try_from(base as u16 + offset) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}
