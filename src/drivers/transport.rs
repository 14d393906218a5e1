//! Transport boundary between drivers and the outside world.
//!
//! A [`Transport`] is an opaque line-oriented byte exchange: write a
//! command, optionally read back one delimited response. Drivers own the
//! protocol; the transport owns the wire. The serial implementation wraps
//! the `serialport` crate and keeps its blocking I/O off the async runtime
//! via `spawn_blocking`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Opaque byte-exchange boundary under every driver.
#[async_trait]
pub trait Transport: Send {
    /// Open the underlying channel.
    async fn open(&mut self) -> DeviceResult<()>;

    /// Close the underlying channel. Safe to call when already closed.
    async fn close(&mut self) -> DeviceResult<()>;

    /// Write a command and read one delimited response.
    async fn exchange(&mut self, command: &str) -> DeviceResult<String>;

    /// Write a command without waiting for a response.
    async fn send(&mut self, command: &str) -> DeviceResult<()>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Human-readable description for logs.
    fn info(&self) -> String;
}

// =============================================================================
// SerialTransport
// =============================================================================

/// Serial transport for RS-232/USB-serial instruments.
///
/// Commands are terminated with the configured line terminator; responses
/// are read byte-by-byte until the response delimiter, bounded by an
/// overall read deadline. All blocking serial I/O runs on the blocking
/// thread pool.
#[derive(Clone)]
pub struct SerialTransport {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3").
    port_name: String,
    /// Baud rate (e.g. 9600, 115200).
    baud_rate: u32,
    /// Overall read deadline per exchange.
    read_timeout: Duration,
    /// Terminator appended to outgoing commands (e.g. "\r\n").
    line_terminator: String,
    /// Character ending an incoming response (e.g. '\n').
    response_delimiter: char,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    #[cfg(not(feature = "instrument_serial"))]
    port: Option<Arc<Mutex<()>>>,
}

impl SerialTransport {
    /// Create a serial transport with default framing ("\r\n" out, '\n' in).
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_delimiter: '\n',
            port: None,
        }
    }

    /// Set the overall read deadline per exchange.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the terminator appended to outgoing commands.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set the character that ends an incoming response.
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> DeviceResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            // Short internal timeout; the overall deadline is enforced in
            // the read loop.
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|err| {
                DeviceError::Connection(format!(
                    "failed to open serial port '{}' at {} baud: {err}",
                    self.port_name, self.baud_rate
                ))
            })?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> DeviceResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }

    async fn exchange(&mut self, command: &str) -> DeviceResult<String> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| DeviceError::Connection("serial port not open".into()))?
            .clone();

        let outgoing = format!("{}{}", command, self.line_terminator);
        let delimiter = self.response_delimiter;
        let deadline = self.read_timeout;
        let command_for_log = command.to_string();

        let joined = tokio::task::spawn_blocking(move || {
            use std::io::{Read, Write};

            let mut guard = port.blocking_lock();

            guard
                .write_all(outgoing.as_bytes())
                .map_err(|err| DeviceError::Connection(format!("serial write failed: {err}")))?;
            guard
                .flush()
                .map_err(|err| DeviceError::Connection(format!("serial flush failed: {err}")))?;

            debug!(command = %command_for_log.trim(), "serial command sent");

            let mut response = String::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > deadline {
                    return Err(DeviceError::Timeout(deadline));
                }

                match guard.read(&mut buffer) {
                    Ok(1) => {
                        let ch = buffer[0] as char;
                        response.push(ch);
                        if ch == delimiter {
                            break;
                        }
                    }
                    Ok(0) => {
                        return Err(DeviceError::Connection(
                            "unexpected EOF from serial port".into(),
                        ));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                        // Port-level timeout is shorter than the deadline;
                        // keep reading.
                        continue;
                    }
                    Err(err) => {
                        return Err(DeviceError::Connection(format!(
                            "serial read failed: {err}"
                        )));
                    }
                    Ok(_) => {
                        return Err(DeviceError::Connection(
                            "serial read returned more than one byte into a one-byte buffer"
                                .into(),
                        ));
                    }
                }
            }

            let response = response.trim().to_string();
            debug!(response = %response, "serial response received");
            Ok(response)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(join_err) => Err(DeviceError::Connection(format!(
                "serial I/O task failed: {join_err}"
            ))),
        }
    }

    async fn send(&mut self, command: &str) -> DeviceResult<()> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| DeviceError::Connection("serial port not open".into()))?
            .clone();

        let outgoing = format!("{}{}", command, self.line_terminator);

        let joined = tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut guard = port.blocking_lock();
            guard
                .write_all(outgoing.as_bytes())
                .map_err(|err| DeviceError::Connection(format!("serial write failed: {err}")))?;
            guard
                .flush()
                .map_err(|err| DeviceError::Connection(format!("serial flush failed: {err}")))?;
            Ok(())
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(join_err) => Err(DeviceError::Connection(format!(
                "serial I/O task failed: {join_err}"
            ))),
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn info(&self) -> String {
        format!("serial({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> DeviceResult<()> {
        Err(DeviceError::Connection(
            "serial support not enabled; rebuild with --features instrument_serial".into(),
        ))
    }

    async fn close(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    async fn exchange(&mut self, _command: &str) -> DeviceResult<String> {
        Err(DeviceError::Connection(
            "serial support not enabled; rebuild with --features instrument_serial".into(),
        ))
    }

    async fn send(&mut self, _command: &str) -> DeviceResult<()> {
        Err(DeviceError::Connection(
            "serial support not enabled; rebuild with --features instrument_serial".into(),
        ))
    }

    fn is_open(&self) -> bool {
        false
    }

    fn info(&self) -> String {
        format!("serial({}, disabled)", self.port_name)
    }
}

// =============================================================================
// MockTransport
// =============================================================================

/// In-memory transport for driver tests: scripted request → response pairs,
/// optional latency, optional failure injection, and a log of everything
/// written.
pub struct MockTransport {
    responses: HashMap<String, String>,
    default_response: Option<String>,
    latency: Duration,
    fail_opens: u32,
    fail_exchanges: u32,
    open: bool,
    sent: Vec<String>,
}

impl MockTransport {
    /// Create an empty mock with no scripted responses.
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: None,
            latency: Duration::ZERO,
            fail_opens: 0,
            fail_exchanges: 0,
            open: false,
            sent: Vec::new(),
        }
    }

    /// Script a response for an exact command string.
    pub fn with_response(mut self, command: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.insert(command.into(), response.into());
        self
    }

    /// Response returned for any command without a scripted match.
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    /// Simulated wire latency per exchange.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` open attempts with a connection error.
    pub fn failing_opens(mut self, count: u32) -> Self {
        self.fail_opens = count;
        self
    }

    /// Fail the next `count` exchanges with a connection error.
    pub fn failing_exchanges(mut self, count: u32) -> Self {
        self.fail_exchanges = count;
        self
    }

    /// Everything written so far, in order.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> DeviceResult<()> {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(DeviceError::Connection("mock open failure".into()));
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> DeviceResult<()> {
        self.open = false;
        Ok(())
    }

    async fn exchange(&mut self, command: &str) -> DeviceResult<String> {
        if !self.open {
            return Err(DeviceError::Connection("mock transport not open".into()));
        }
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_exchanges > 0 {
            self.fail_exchanges -= 1;
            return Err(DeviceError::Connection("mock exchange failure".into()));
        }
        self.sent.push(command.to_string());
        self.responses
            .get(command)
            .cloned()
            .or_else(|| self.default_response.clone())
            .ok_or_else(|| {
                DeviceError::Protocol(format!("no scripted response for command '{command}'"))
            })
    }

    async fn send(&mut self, command: &str) -> DeviceResult<()> {
        if !self.open {
            return Err(DeviceError::Connection("mock transport not open".into()));
        }
        self.sent.push(command.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn info(&self) -> String {
        "mock-transport".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_transport_builder() {
        let transport = SerialTransport::new("/dev/ttyUSB0", 9600)
            .with_read_timeout(Duration::from_millis(500))
            .with_line_terminator("\n")
            .with_response_delimiter('\r');

        assert_eq!(transport.read_timeout, Duration::from_millis(500));
        assert_eq!(transport.line_terminator, "\n");
        assert_eq!(transport.response_delimiter, '\r');
        assert!(!transport.is_open());
        assert!(transport.info().contains("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn mock_transport_scripted_exchange() {
        let mut mock = MockTransport::new().with_response("PR MV", "0");
        mock.open().await.expect("open");

        assert_eq!(mock.exchange("PR MV").await.expect("scripted"), "0");
        let err = mock.exchange("PR XX").await.expect_err("unscripted");
        assert!(matches!(err, DeviceError::Protocol(_)));
        assert_eq!(mock.sent(), ["PR MV", "PR XX"]);
    }

    #[tokio::test]
    async fn mock_transport_requires_open() {
        let mut mock = MockTransport::new().with_default_response("ok");
        let err = mock.exchange("anything").await.expect_err("closed");
        assert!(matches!(err, DeviceError::Connection(_)));
    }

    #[tokio::test]
    async fn mock_transport_failure_injection() {
        let mut mock = MockTransport::new()
            .with_default_response("ok")
            .failing_opens(1)
            .failing_exchanges(1);

        assert!(mock.open().await.is_err());
        mock.open().await.expect("second open succeeds");
        assert!(mock.exchange("cmd").await.is_err());
        assert_eq!(mock.exchange("cmd").await.expect("recovered"), "ok");
    }
}
