//! Serial transport backed by the `serialport` crate

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::{SerialSettings, Transport, TransportProvider};
use crate::error::TransportResult;

pub struct SerialTransport {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port at 8N1 with no flow control and DTR asserted.
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyUSB0" or "COM3")
    /// * `settings` - Baud rate and read/write timeout
    pub fn open(path: &str, settings: &SerialSettings) -> TransportResult<Self> {
        let mut port = serialport::new(path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.io_timeout)
            .open()?;

        // ESP32 dev boards gate their UART bridge on DTR.
        port.write_data_terminal_ready(true)?;

        Ok(Self {
            name: path.to_string(),
            port,
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransportResult<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> TransportResult<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn available(&mut self) -> TransportResult<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn clear_buffers(&mut self) -> TransportResult<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> TransportResult<()> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn try_clone(&self) -> TransportResult<Box<dyn Transport>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(Self {
            name: self.name.clone(),
            port,
        }))
    }
}

/// Enumerates the ports the OS reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialProvider;

impl TransportProvider for SerialProvider {
    fn candidates(&self) -> TransportResult<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|info| info.port_name).collect())
    }

    fn open(&self, name: &str, settings: &SerialSettings) -> TransportResult<Box<dyn Transport>> {
        SerialTransport::open(name, settings)
            .map(|transport| Box::new(transport) as Box<dyn Transport>)
    }
}
