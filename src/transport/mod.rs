//! Byte-stream transports the gateway can be reached over.

use std::time::Duration;

use crate::error::TransportResult;

pub mod mock;
mod serial;

pub use serial::{SerialProvider, SerialTransport};

/// Line settings applied when a candidate is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Used for both reads and writes.
    pub io_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// An open, exclusively owned channel to one device.
///
/// Dropping the handle closes it.
pub trait Transport: Send {
    /// Port identifier this handle was opened on
    fn name(&self) -> &str;

    /// Read into buffer, returns number of bytes read (0 on timeout)
    fn read(&mut self, buffer: &mut [u8]) -> TransportResult<usize>;

    /// Write the whole frame and flush it
    fn write_all(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Bytes waiting in the input buffer
    fn available(&mut self) -> TransportResult<usize>;

    /// Discard anything buffered in either direction
    fn clear_buffers(&mut self) -> TransportResult<()>;

    /// How long an idle `read` blocks before returning 0. Applies to this
    /// handle only, not to its clones.
    fn set_read_timeout(&mut self, timeout: Duration) -> TransportResult<()>;

    /// Second handle on the same port, so reading and writing can happen on
    /// different threads.
    fn try_clone(&self) -> TransportResult<Box<dyn Transport>>;
}

/// Source of candidate ports.
pub trait TransportProvider: Send + Sync {
    /// Port identifiers present right now, in platform enumeration order
    fn candidates(&self) -> TransportResult<Vec<String>>;

    fn open(&self, name: &str, settings: &SerialSettings) -> TransportResult<Box<dyn Transport>>;
}
