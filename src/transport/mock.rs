//! In-process serial ports for tests and dry runs.
//!
//! A [`MockPort`] is the device side: tests inject inbound lines and inspect
//! what the host wrote. [`MockTransport`] handles are the host side and count
//! themselves open until dropped.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use super::{SerialSettings, Transport, TransportProvider};
use crate::{
    error::{TransportError, TransportResult},
    protocol,
};

/// How long an empty read blocks unless the port or handle says otherwise.
const IDLE_READ: Duration = Duration::from_millis(5);

#[derive(Default)]
struct MockPortState {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    reply: Option<String>,
    fail_writes: bool,
    opens: usize,
    open_handles: usize,
    idle_read: Option<Duration>,
}

#[derive(Clone)]
pub struct MockPort {
    name: String,
    state: Arc<Mutex<MockPortState>>,
}

impl MockPort {
    /// A port whose device never answers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockPortState::default())),
        }
    }

    /// A port that answers every request frame with `reply`.
    pub fn responder(name: &str, reply: &str) -> Self {
        let port = Self::new(name);
        port.state().reply = Some(reply.to_string());
        port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue raw bytes as if the device had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes);
    }

    /// Queue one CRLF-terminated line.
    pub fn inject_line(&self, line: &str) {
        let mut state = self.state();
        state.inbound.extend(line.as_bytes());
        state.inbound.extend(protocol::LINE_TERMINATOR.as_bytes());
    }

    /// Every write the host made, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn request_count(&self) -> usize {
        let frame = protocol::request_frame();
        self.state().writes.iter().filter(|w| **w == frame).count()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Times a provider opened this port.
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Host handles (opened or cloned) not yet dropped.
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    /// Handles opened from now on block this long on an idle read, the way
    /// a real port waits out its configured timeout.
    pub fn set_idle_read(&self, timeout: Duration) {
        self.state().idle_read = Some(timeout);
    }

    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }

    /// Open a host-side handle.
    pub fn open(&self) -> MockTransport {
        self.state().opens += 1;
        self.attach()
    }

    fn attach(&self) -> MockTransport {
        let read_timeout = {
            let mut state = self.state();
            state.open_handles += 1;
            state.idle_read.unwrap_or(IDLE_READ)
        };
        MockTransport {
            port: self.clone(),
            read_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockPortState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct MockTransport {
    port: MockPort,
    read_timeout: Duration,
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.port.name
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransportResult<usize> {
        let count = {
            let mut state = self.port.state();
            let count = state.inbound.len().min(buffer.len());
            for (slot, byte) in buffer.iter_mut().zip(state.inbound.drain(..count)) {
                *slot = byte;
            }
            count
        };

        if count == 0 {
            thread::sleep(self.read_timeout);
        }
        Ok(count)
    }

    fn write_all(&mut self, data: &[u8]) -> TransportResult<()> {
        let mut state = self.port.state();
        if state.fail_writes {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device went away",
            )));
        }

        state.writes.push(data.to_vec());
        if data == protocol::request_frame().as_slice() {
            if let Some(reply) = state.reply.clone() {
                state.inbound.extend(reply.as_bytes());
                state.inbound.extend(protocol::LINE_TERMINATOR.as_bytes());
            }
        }
        Ok(())
    }

    fn available(&mut self) -> TransportResult<usize> {
        Ok(self.port.state().inbound.len())
    }

    fn clear_buffers(&mut self) -> TransportResult<()> {
        self.port.state().inbound.clear();
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> TransportResult<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn try_clone(&self) -> TransportResult<Box<dyn Transport>> {
        Ok(Box::new(self.port.attach()))
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut state = self.port.state();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

/// Provider over a fixed list of mock ports.
#[derive(Default)]
pub struct MockProvider {
    ports: Vec<MockPort>,
    busy: HashSet<String>,
    attempts: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(ports: Vec<MockPort>) -> Self {
        Self {
            ports,
            ..Self::default()
        }
    }

    /// Make opening `name` fail the way a port held by another process does.
    /// A port this process still holds a handle on fails the same way.
    pub fn with_busy(mut self, name: &str) -> Self {
        self.busy.insert(name.to_string());
        self
    }

    /// Every open attempt, in order, including failed ones.
    pub fn open_attempts(&self) -> Vec<String> {
        match self.attempts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TransportProvider for MockProvider {
    fn candidates(&self) -> TransportResult<Vec<String>> {
        Ok(self.ports.iter().map(|port| port.name.clone()).collect())
    }

    fn open(&self, name: &str, _settings: &SerialSettings) -> TransportResult<Box<dyn Transport>> {
        match self.attempts.lock() {
            Ok(mut guard) => guard.push(name.to_string()),
            Err(poisoned) => poisoned.into_inner().push(name.to_string()),
        }

        if self.busy.contains(name) {
            return Err(TransportError::Other(format!("{name}: port is busy")));
        }

        let port = self
            .ports
            .iter()
            .find(|port| port.name == name)
            .ok_or_else(|| TransportError::Other(format!("{name}: no such port")))?;

        // Serial ports are opened exclusively; a leftover handle blocks reopening.
        if port.open_handles() > 0 {
            return Err(TransportError::Other(format!("{name}: port is busy")));
        }

        Ok(Box::new(port.open()))
    }
}
