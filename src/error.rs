//! Custom error types for the application.
//!
//! This module defines the primary error type, `DeviceError`, used across the
//! device control core. Using the `thiserror` crate, it provides a centralized
//! taxonomy for everything that can go wrong between a caller submitting a
//! command and a driver talking to hardware.
//!
//! ## Error Hierarchy
//!
//! - **`UnknownDevice`** / **`DuplicateDevice`**: registry-level routing and
//!   lifecycle errors — the device name is not open, or is already open.
//! - **`Connection`**: the driver could not establish or keep its transport
//!   (port not found, handshake failure, I/O error on the wire).
//! - **`Protocol`**: the device answered, but the response was malformed or
//!   unexpected for the command sent. Scoped to the single failing command.
//! - **`Timeout`**: a bounded device I/O operation did not complete in time.
//! - **`QueueFull`**: the per-device command queue hit its configured bound
//!   under the fail-fast submit policy.
//! - **`Cancelled`**: the command was removed from the queue before it
//!   started executing.
//! - **`Faulted`**: the device crossed its consecutive-failure threshold and
//!   rejects commands until an explicit reconnect.
//! - **`Config`**: semantic errors in the loaded settings.
//!
//! The enum is `Clone` so a failed [`crate::core::CommandResult`] can be
//! broadcast to every subscriber as well as returned to the submitting
//! caller.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the device error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors produced by the device control core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("device '{0}' is already open")]
    DuplicateDevice(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device did not respond within {0:?}")]
    Timeout(Duration),

    #[error("command queue for device '{0}' is full")]
    QueueFull(String),

    #[error("command was cancelled before execution")]
    Cancelled,

    #[error("device '{0}' is in the error state after {1} consecutive failures; reconnect required")]
    Faulted(String, u32),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DeviceError {
    /// Whether the error indicates trouble on the transport itself, as
    /// opposed to a bad command or caller mistake. Transport trouble counts
    /// toward the worker's consecutive-failure threshold.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, DeviceError::Connection(_) | DeviceError::Timeout(_))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_classified() {
        assert!(DeviceError::Timeout(Duration::from_secs(1)).is_transport_failure());
        assert!(DeviceError::Connection("port gone".into()).is_transport_failure());
        assert!(!DeviceError::Protocol("garbled".into()).is_transport_failure());
        assert!(!DeviceError::Cancelled.is_transport_failure());
    }

    #[test]
    fn io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such port");
        let err: DeviceError = io.into();
        assert!(matches!(err, DeviceError::Connection(_)));
    }
}
