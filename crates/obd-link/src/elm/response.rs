//! Parsing of raw ELM327 replies

use std::fmt;

/// Adapter-level failure reported in place of data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmFault {
    /// `?` - the adapter did not understand the command
    UnknownCommand,
    /// No vehicle protocol could be established
    UnableToConnect,
    /// `BUS INIT: ...ERROR` on ISO 9141 / KWP buses
    BusInit,
    CanError,
    /// The request was interrupted
    Stopped,
    BufferFull,
    /// `7F <service> <nrc>` negative response from the vehicle
    Negative { service: u8, nrc: u8 },
    /// Reply that is neither a known message nor hex data
    Garbled(String),
}

impl fmt::Display for ElmFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElmFault::UnknownCommand => f.write_str("command not recognized by adapter"),
            ElmFault::UnableToConnect => f.write_str("unable to connect to vehicle bus"),
            ElmFault::BusInit => f.write_str("bus initialization error"),
            ElmFault::CanError => f.write_str("CAN bus error"),
            ElmFault::Stopped => f.write_str("request stopped"),
            ElmFault::BufferFull => f.write_str("adapter buffer full"),
            ElmFault::Negative { service, nrc } => write!(
                f,
                "negative response to service 0x{:02X} (NRC 0x{:02X})",
                service, nrc
            ),
            ElmFault::Garbled(raw) => write!(f, "unparseable reply: {}", raw),
        }
    }
}

/// Parsed reply to a vehicle request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmReply {
    /// One entry per responding message (ECU line or reassembled CAN frame set)
    Data(Vec<Vec<u8>>),
    /// `NO DATA` - nothing to report
    NoData,
    Fault(ElmFault),
}

impl ElmReply {
    /// First message starting with `prefix`, with the prefix removed
    pub fn payload(&self, prefix: &[u8]) -> Option<&[u8]> {
        match self {
            ElmReply::Data(messages) => messages
                .iter()
                .find(|m| m.starts_with(prefix))
                .map(|m| &m[prefix.len()..]),
            _ => None,
        }
    }

    /// All messages starting with `prefix`, prefixes removed
    pub fn payloads<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        let messages: &[Vec<u8>] = match self {
            ElmReply::Data(messages) => messages,
            _ => &[],
        };
        messages
            .iter()
            .filter(move |m| m.starts_with(prefix))
            .map(move |m| &m[prefix.len()..])
    }
}

/// Lines of a raw reply with the prompt, echo and status chatter removed
pub fn clean_lines(raw: &str, command: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(|line| line.trim().trim_end_matches('>').trim())
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case(command))
        .filter(|line| !is_status_chatter(line))
        .map(String::from)
        .collect()
}

/// Progress lines the adapter prints ahead of the data
///
/// A failed K-line init (`BUS INIT: ...ERROR`) is kept so it surfaces as a fault.
fn is_status_chatter(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    upper.starts_with("SEARCHING") || (upper.starts_with("BUS INIT") && !upper.contains("ERROR"))
}

/// Text of an `AT` command reply, lines joined by spaces
pub fn text(raw: &str, command: &str) -> String {
    clean_lines(raw, command).join(" ")
}

/// Parse the reply to an OBD-II request
pub fn parse(raw: &str, command: &str) -> ElmReply {
    let lines = clean_lines(raw, command);
    if lines.is_empty() {
        return ElmReply::NoData;
    }

    if let Some(fault) = lines.iter().find_map(|l| status_fault(l)) {
        return fault;
    }

    // CAN multi-frame replies prefix each frame with an index ("0:", "1:")
    // and may lead with a byte-count line ("014").
    let framed = lines.iter().any(|l| frame_index(l).is_some());
    let mut messages: Vec<Vec<u8>> = Vec::new();
    let mut assembled: Vec<u8> = Vec::new();

    for line in &lines {
        let (index, body) = match frame_index(line) {
            Some((index, body)) => (Some(index), body),
            None => (None, line.as_str()),
        };
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();

        if framed && index.is_none() && compact.len() <= 3 {
            continue;
        }

        let bytes = match hex::decode(&compact) {
            Ok(bytes) => bytes,
            Err(_) => return ElmReply::Fault(ElmFault::Garbled(line.clone())),
        };

        if let &[0x7F, service, nrc, ..] = bytes.as_slice() {
            return ElmReply::Fault(ElmFault::Negative { service, nrc });
        }

        match index {
            Some(0) if !assembled.is_empty() => {
                messages.push(std::mem::take(&mut assembled));
                assembled.extend(bytes);
            }
            Some(_) => assembled.extend(bytes),
            None => messages.push(bytes),
        }
    }
    if !assembled.is_empty() {
        messages.push(assembled);
    }

    if messages.is_empty() {
        ElmReply::NoData
    } else {
        ElmReply::Data(messages)
    }
}

fn status_fault(line: &str) -> Option<ElmReply> {
    let upper = line.to_ascii_uppercase();
    let fault = if upper.contains("NO DATA") {
        return Some(ElmReply::NoData);
    } else if upper == "?" {
        ElmFault::UnknownCommand
    } else if upper.contains("UNABLE TO CONNECT") {
        ElmFault::UnableToConnect
    } else if upper.contains("BUS INIT") && upper.contains("ERROR") {
        ElmFault::BusInit
    } else if upper.contains("CAN ERROR") {
        ElmFault::CanError
    } else if upper.contains("STOPPED") {
        ElmFault::Stopped
    } else if upper.contains("BUFFER FULL") {
        ElmFault::BufferFull
    } else {
        return None;
    };
    Some(ElmReply::Fault(fault))
}

fn frame_index(line: &str) -> Option<(u8, &str)> {
    let (index, body) = line.split_once(':')?;
    let index = u8::from_str_radix(index.trim(), 16).ok()?;
    Some((index, body))
}
