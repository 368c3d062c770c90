//! Finds the port the sensor gateway sits on.
//!
//! Candidates are probed one at a time, in the order the platform lists
//! them: open, flush, let the board finish booting, ask for a reading, and
//! wait briefly for a frame that looks like one. The first port that answers
//! wins and is handed over still open.

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{TransportError, TransportResult},
    protocol::{self, LineAssembler},
    sink_debug, sink_info, sink_warn,
    transport::{SerialSettings, Transport, TransportProvider},
    utils::logging::SharedLog,
};

const READ_CHUNK: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub serial: SerialSettings,
    /// Wait after opening, before the request; opening the port resets most
    /// ESP32 boards.
    pub settle_delay: Duration,
    pub response_window: Duration,
    pub poll_interval: Duration,
    pub port_filter: Option<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            settle_delay: Duration::from_secs(2),
            response_window: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
            port_filter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Probing(usize),
    Confirmed(usize),
    Exhausted,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryState::Idle => write!(f, "idle"),
            DiscoveryState::Probing(i) => write!(f, "probing candidate {i}"),
            DiscoveryState::Confirmed(i) => write!(f, "confirmed candidate {i}"),
            DiscoveryState::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Result of probing a single candidate.
pub enum ProbeResult {
    Confirmed {
        transport: Box<dyn Transport>,
        frame: String,
    },
    /// Port opened but no valid frame arrived inside the window.
    NoResponse,
    TransportFault(TransportError),
}

/// Why a candidate was passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    NoResponse,
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedProbe {
    pub port: String,
    pub failure: ProbeFailure,
}

pub struct ConfirmedDevice {
    pub port: String,
    pub transport: Box<dyn Transport>,
    /// The frame that passed the handshake. It is not persisted.
    pub handshake_frame: String,
}

pub enum DiscoveryOutcome {
    Confirmed(ConfirmedDevice),
    Exhausted { failures: Vec<FailedProbe> },
}

pub struct DiscoveryEngine {
    provider: Arc<dyn TransportProvider>,
    settings: ProbeSettings,
    log: SharedLog,
}

impl DiscoveryEngine {
    pub fn new(provider: Arc<dyn TransportProvider>, settings: ProbeSettings, log: SharedLog) -> Self {
        Self {
            provider,
            settings,
            log,
        }
    }

    /// Enumerate ports now and probe them in order. Blocks for up to
    /// settle delay + response window per candidate.
    pub fn discover(&self) -> DiscoveryOutcome {
        let mut state = DiscoveryState::Idle;
        let candidates = match self.provider.candidates() {
            Ok(candidates) => candidates,
            Err(err) => {
                sink_warn!(self.log, "Failed to enumerate serial ports: {err}");
                Vec::new()
            }
        };

        if candidates.is_empty() {
            sink_warn!(self.log, "No serial ports found");
        } else {
            sink_info!(self.log, "Found ports: {}", candidates.join(", "));
        }

        let mut failures = Vec::new();
        for (index, port) in candidates.into_iter().enumerate() {
            if let Some(filter) = &self.settings.port_filter {
                if !port.contains(filter.as_str()) {
                    sink_debug!(self.log, "Skipping {port}: does not match filter '{filter}'");
                    continue;
                }
            }

            state = DiscoveryState::Probing(index);
            sink_info!(self.log, "Checking port {port} ({state})");

            match self.probe(&port) {
                ProbeResult::Confirmed { transport, frame } => {
                    state = DiscoveryState::Confirmed(index);
                    sink_info!(self.log, "Sensor gateway answered on {port} ({state})");
                    return DiscoveryOutcome::Confirmed(ConfirmedDevice {
                        port,
                        transport,
                        handshake_frame: frame,
                    });
                }
                ProbeResult::NoResponse => {
                    sink_info!(self.log, "{port}: no sensor frame within {:?}", self.settings.response_window);
                    failures.push(FailedProbe {
                        port,
                        failure: ProbeFailure::NoResponse,
                    });
                }
                ProbeResult::TransportFault(err) => {
                    sink_warn!(self.log, "{port}: {err}");
                    failures.push(FailedProbe {
                        port,
                        failure: ProbeFailure::Transport(err.to_string()),
                    });
                }
            }
        }

        sink_debug!(self.log, "Discovery finished in state {state}");
        state = DiscoveryState::Exhausted;
        sink_warn!(self.log, "Sensor gateway not found ({state})");
        DiscoveryOutcome::Exhausted { failures }
    }

    /// One handshake attempt. The transport is closed on every path except
    /// `Confirmed`.
    pub fn probe(&self, port: &str) -> ProbeResult {
        let mut transport = match self.provider.open(port, &self.settings.serial) {
            Ok(transport) => transport,
            Err(err) => return ProbeResult::TransportFault(err),
        };

        match self.handshake(&mut *transport) {
            Ok(Some(frame)) => ProbeResult::Confirmed { transport, frame },
            Ok(None) => ProbeResult::NoResponse,
            Err(err) => ProbeResult::TransportFault(err),
        }
    }

    fn handshake(&self, transport: &mut dyn Transport) -> TransportResult<Option<String>> {
        transport.clear_buffers()?;
        thread::sleep(self.settings.settle_delay);

        transport.write_all(&protocol::request_frame())?;

        let deadline = Instant::now() + self.settings.response_window;
        let mut assembler = LineAssembler::new();
        let mut buffer = [0u8; READ_CHUNK];

        while Instant::now() < deadline {
            if transport.available()? > 0 {
                let read = transport.read(&mut buffer)?;
                for line in assembler.push(&buffer[..read]) {
                    sink_debug!(self.log, "{}: received {line}", transport.name());
                    if protocol::is_valid_reading_frame(&line) {
                        return Ok(Some(line));
                    }
                }
            }
            thread::sleep(self.settings.poll_interval);
        }

        Ok(None)
    }
}
