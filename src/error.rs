//! Error types for the serial link and the wire protocol

/// Failures on the serial link: opening, reading, writing or cloning a port.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Serial port error (busy, missing, permission denied)
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error while talking to an open port
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Why an inbound line could not become a reading.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Line is not JSON at all
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// JSON, but required fields are missing or mistyped
    #[error("invalid reading: {0}")]
    InvalidReading(#[source] serde_json::Error),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
