//! Serial transport for RS-232 and bluetooth-serial focusers.
//!
//! Wraps the `serialport` crate and provides async I/O by running the
//! synchronous serial operations on Tokio's blocking task executor.

use super::Transport;
use crate::error::{FocusResult, FocuserError};
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use serialport::SerialPort;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Serial link to a focuser.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Per-read timeout; a read that sees no byte within it returns 0.
    read_timeout: Duration,

    /// The actual serial port (behind Arc<Mutex> for async access)
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: Duration::from_millis(500),
            port: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    fn default_config(&self) -> serde_json::Value {
        json!({
            "port": self.port_name,
            "baud_rate": self.baud_rate,
            "timeout_ms": self.read_timeout.as_millis(),
        })
    }

    async fn open(&mut self) -> FocusResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                FocuserError::Connection(format!(
                    "failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(
            "serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    async fn close(&mut self) -> FocusResult<()> {
        if self.port.take().is_some() {
            debug!("serial port '{}' closed", self.port_name);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> FocusResult<()> {
        let port = self.port.as_ref().ok_or(FocuserError::NotConnected)?;
        let port = port.clone();
        let data = data.to_vec();

        // Blocking serial I/O runs on a dedicated thread.
        tokio::task::spawn_blocking(move || -> FocusResult<()> {
            use std::io::Write;
            let mut guard = port.blocking_lock();
            guard.write_all(&data)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| FocuserError::HardwareFault(format!("serial I/O task panicked: {}", e)))?
    }

    async fn read(&mut self, buf: &mut [u8]) -> FocusResult<usize> {
        let port = self.port.as_ref().ok_or(FocuserError::NotConnected)?;
        let port = port.clone();
        let wanted = buf.len();
        let deadline = self.read_timeout;

        let data = tokio::task::spawn_blocking(move || -> FocusResult<Vec<u8>> {
            use std::io::Read;
            let mut guard = port.blocking_lock();
            let mut scratch = vec![0u8; wanted];
            let start = std::time::Instant::now();
            loop {
                match guard.read(&mut scratch) {
                    Ok(0) => {
                        return Err(FocuserError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "unexpected EOF from serial port",
                        )))
                    }
                    Ok(n) => {
                        scratch.truncate(n);
                        return Ok(scratch);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than our overall deadline.
                        if start.elapsed() >= deadline {
                            return Ok(Vec::new());
                        }
                    }
                    Err(e) => return Err(FocuserError::Io(e)),
                }
            }
        })
        .await
        .map_err(|e| FocuserError::HardwareFault(format!("serial I/O task panicked: {}", e)))??;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_config() {
        let transport = SerialTransport::new("/dev/ttyUSB0", 9600);
        assert_eq!(transport.name(), "serial");
        let config = transport.default_config();
        assert_eq!(config["port"], "/dev/ttyUSB0");
        assert_eq!(config["baud_rate"], 9600);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_io_before_open_is_rejected() {
        let mut transport = SerialTransport::new("/dev/ttyUSB0", 115200);
        assert!(matches!(
            transport.write(b"x").await.unwrap_err(),
            FocuserError::NotConnected
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            transport.read(&mut buf).await.unwrap_err(),
            FocuserError::NotConnected
        ));
    }
}
