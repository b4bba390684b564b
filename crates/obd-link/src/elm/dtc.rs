//! Trouble code encoding for modes 03, 07, 0A and the freeze-frame DTC

use obd_core::CodeSystem;

use super::ElmReply;

const SYSTEMS: [CodeSystem; 4] = [
    CodeSystem::Powertrain,
    CodeSystem::Chassis,
    CodeSystem::Body,
    CodeSystem::Network,
];

/// Decode a two-byte trouble code; `0000` is padding and yields `None`
pub fn decode(high: u8, low: u8) -> Option<String> {
    if high == 0 && low == 0 {
        return None;
    }
    let system = SYSTEMS[(high >> 6) as usize];
    Some(format!(
        "{}{}{:X}{:02X}",
        system.letter(),
        (high >> 4) & 0x03,
        high & 0x0F,
        low
    ))
}

/// Encode a code string back into its two-byte form
pub fn encode(code: &str) -> Option<[u8; 2]> {
    if !obd_core::models::is_valid_code(code) {
        return None;
    }
    let code = code.to_ascii_uppercase();
    let system = CodeSystem::from_code(&code)?;
    let system_bits = SYSTEMS.iter().position(|s| *s == system)? as u8;
    let digits = u16::from_str_radix(&code[1..], 16).ok()?;
    let high = (system_bits << 6) | ((digits >> 8) as u8 & 0x3F);
    Some([high, (digits & 0xFF) as u8])
}

/// Codes from a mode 03/07/0A reply, in reply order without duplicates
///
/// CAN replies lead with a count byte, which makes the payload length odd;
/// legacy protocols send fixed three-code frames padded with `0000`.
pub fn parse_codes(reply: &ElmReply, response_sid: u8) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for payload in reply.payloads(&[response_sid]) {
        let data = if payload.len() % 2 == 1 {
            &payload[1..]
        } else {
            payload
        };
        for pair in data.chunks_exact(2) {
            if let Some(code) = decode(pair[0], pair[1]) {
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
    }
    codes
}

/// Code that triggered freeze frame 0 (mode 02, PID 02)
pub fn parse_freeze_frame_code(reply: &ElmReply) -> Option<String> {
    let data = reply.payload(&[0x42, 0x02, 0x00])?;
    match data {
        [high, low, ..] => decode(*high, *low),
        _ => None,
    }
}
