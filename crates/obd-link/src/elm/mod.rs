//! ELM327 command set
//!
//! ELM327-compatible adapters speak an ASCII command protocol: each command is
//! terminated by `\r` and each reply ends with the `>` prompt. `AT` commands
//! configure the adapter; hex commands (`0100`, `03`, ...) are forwarded to the
//! vehicle as OBD-II requests.

pub mod dtc;
pub mod pid;
pub mod response;

pub use response::{ElmFault, ElmReply};

/// Reply terminator sent by the adapter
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const TERMINATOR: &str = "\r";

/// Adapter reset; the reply carries the firmware banner
pub const RESET: &str = "ATZ";

/// Echo off, linefeeds off, spaces off, headers off, adaptive timing on
pub const INIT_SEQUENCE: &[&str] = &["ATE0", "ATL0", "ATS0", "ATH0", "ATAT1"];

/// Human-readable description of the active protocol
pub const DESCRIBE_PROTOCOL: &str = "ATDP";

/// Banner substring identifying an ELM327-compatible adapter
pub const BANNER: &str = "ELM";

/// `ATSP` command for a protocol selector ("0" = automatic)
pub fn set_protocol(selector: &str) -> String {
    format!("ATSP{}", selector)
}

/// OBD-II service (mode) numbers
pub mod mode {
    /// Current powertrain data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Stored trouble codes
    pub const STORED_CODES: u8 = 0x03;
    /// Clear trouble codes and stored values
    pub const CLEAR_CODES: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_CODES: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_CODES: u8 = 0x0A;

    /// Positive response service id for a request mode
    pub const fn response(mode: u8) -> u8 {
        mode + 0x40
    }
}

/// Mode 09 info types
pub mod info_type {
    pub const VIN: u8 = 0x02;
    pub const ECU_NAME: u8 = 0x0A;
}

/// Hex request string, e.g. `request(0x01, &[0x0C])` is `"010C"`
pub fn request(mode: u8, args: &[u8]) -> String {
    let mut cmd = format!("{:02X}", mode);
    cmd.push_str(&hex::encode_upper(args));
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_formatting() {
        assert_eq!(request(mode::CURRENT_DATA, &[0x0C]), "010C");
        assert_eq!(request(mode::STORED_CODES, &[]), "03");
        assert_eq!(request(mode::FREEZE_FRAME, &[0x05, 0x00]), "020500");
        assert_eq!(mode::response(mode::PERMANENT_CODES), 0x4A);
        assert_eq!(set_protocol("0"), "ATSP0");
    }
}
