//! Line protocol spoken by the sensor gateway.
//!
//! Every frame is one CRLF-terminated line. The host sends a fixed JSON
//! command; the gateway answers with a JSON object describing its sensors.
//! Anything else on the line (boot banners, debug prints) is noise.

use serde_json::Value;

use crate::{error::ParseError, models::SensorReading};

/// Command asking the gateway for a fresh reading.
pub const REQUEST_COMMAND: &str = r#"{"command":"get_data"}"#;

pub const LINE_TERMINATOR: &str = "\r\n";

/// Longest unterminated line kept before the buffer is discarded.
const MAX_PENDING_LINE: usize = 4096;

/// Bytes for one request frame, terminator included.
pub fn request_frame() -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_COMMAND.len() + LINE_TERMINATOR.len());
    frame.extend_from_slice(REQUEST_COMMAND.as_bytes());
    frame.extend_from_slice(LINE_TERMINATOR.as_bytes());
    frame
}

/// Only lines opening a JSON object are protocol frames.
pub fn is_protocol_line(line: &str) -> bool {
    line.starts_with('{')
}

/// Handshake check: a JSON object carrying at least `temperature` and `humidity`.
pub fn is_valid_reading_frame(line: &str) -> bool {
    if !is_protocol_line(line) {
        return false;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => map.contains_key("temperature") && map.contains_key("humidity"),
        _ => false,
    }
}

/// Full parse of a response frame into a reading.
pub fn parse_reading(line: &str) -> Result<SensorReading, ParseError> {
    let value: Value = serde_json::from_str(line).map_err(ParseError::Malformed)?;
    serde_json::from_value(value).map_err(ParseError::InvalidReading)
}

/// Splits a raw byte stream into lines.
///
/// Serial reads hand back arbitrary chunks, so a frame may arrive in pieces
/// or several frames may arrive in one read. Only trailing whitespace is
/// stripped; a line keeps whatever it starts with.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.pending);
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim_end();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            } else if !self.discarding {
                if self.pending.len() == MAX_PENDING_LINE {
                    self.pending.clear();
                    self.discarding = true;
                } else {
                    self.pending.push(byte);
                }
            }
        }

        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
