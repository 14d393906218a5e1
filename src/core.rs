//! Core types and traits for the device control system.
//!
//! Everything that crosses a thread boundary lives here: the command
//! envelope submitted by callers, the result and status events published
//! back, the lifecycle states, and the [`DeviceDriver`] trait that concrete
//! instrument drivers implement.
//!
//! # Data Flow
//!
//! ```text
//! Facade / scan engine → CommandQueue → ControlWorker → DeviceDriver → hardware
//!                                           ↓
//!                         EventSink (CommandResult + StatusUpdate broadcast)
//!                                           ↓
//!                         any number of subscribers (CLI, panels, scripts)
//! ```
//!
//! # Command Flow
//!
//! Each submitted [`Command`] is executed exactly once by the device's
//! worker, in submission order. Callers that need the outcome await a
//! dedicated reply channel; every outcome is also published on the device's
//! event stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeviceError, DeviceResult};

/// Unique identifier assigned to every submitted command.
pub type CommandId = Uuid;

// =============================================================================
// Operations and Commands
// =============================================================================

/// The instruction carried by a [`Command`], interpreted by the driver.
///
/// `Connect` and `Disconnect` are also routed through the queue so that a
/// faulted device can be explicitly reconnected in order with everything
/// else the caller submitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Operation {
    /// (Re-)establish the driver's transport. Clears a fault condition on
    /// success.
    Connect,
    /// Close the driver's transport without closing the device.
    Disconnect,
    /// Begin a continuous operation (e.g. pump flow at the set rate).
    Start,
    /// Halt motion or flow immediately.
    Stop,
    /// Move to an absolute target (stage position in mm, or equivalent).
    Move { target: f64 },
    /// Push out a fixed volume in microliters (pumps).
    Dispense { volume_ul: f64 },
    /// Draw in a fixed volume in microliters (pumps).
    Aspirate { volume_ul: f64 },
    /// Set a named device parameter (flow rate, units, filter, dwell, ...).
    SetParameter {
        name: String,
        value: serde_json::Value,
    },
    /// Read the device's current telemetry as a command (in queue order),
    /// as opposed to the worker's own idle polling.
    QueryStatus,
    /// Driver-specific escape hatch.
    Custom {
        name: String,
        args: serde_json::Value,
    },
}

impl Operation {
    /// Short human-readable label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Move { .. } => "move",
            Operation::Dispense { .. } => "dispense",
            Operation::Aspirate { .. } => "aspirate",
            Operation::SetParameter { .. } => "set-parameter",
            Operation::QueryStatus => "query-status",
            Operation::Custom { .. } => "custom",
        }
    }
}

/// A caller-issued instruction destined for one device. Immutable once
/// enqueued.
#[derive(Clone, Debug)]
pub struct Command {
    /// Unique id, also carried by the eventual [`CommandResult`].
    pub id: CommandId,
    /// Target device name (the registry's primary key).
    pub device: String,
    /// What to do.
    pub operation: Operation,
    /// Whether a caller is awaiting the outcome on a reply channel.
    pub requires_response: bool,
    /// When the command was accepted into the queue.
    pub submitted_at: DateTime<Utc>,
}

impl Command {
    /// Build a new command for `device` with a fresh id.
    pub fn new(device: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            device: device.into(),
            operation,
            requires_response: false,
            submitted_at: Utc::now(),
        }
    }
}

// =============================================================================
// Results and Events
// =============================================================================

/// Device-specific data returned by a successful operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// The operation completed and returns nothing.
    None,
    /// A single numeric reading with its unit.
    Scalar { value: f64, unit: String },
    /// A raw textual response.
    Text(String),
    /// A full telemetry snapshot (from `QueryStatus`).
    Status(Telemetry),
    /// Driver-specific structured data.
    Json(serde_json::Value),
}

/// The outcome of one executed (or cancelled) command. Produced exactly once
/// per command.
#[derive(Clone, Debug)]
pub struct CommandResult {
    /// Id of the command this result answers.
    pub id: CommandId,
    /// Device that executed the command.
    pub device: String,
    /// Payload on success, structured error on failure.
    pub result: DeviceResult<ResponsePayload>,
    /// When the worker finished (or cancelled) the command.
    pub finished_at: DateTime<Utc>,
}

impl CommandResult {
    /// True when the command executed without error.
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Periodic, unsolicited telemetry snapshot from a device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Device the snapshot came from.
    pub device: String,
    /// When the snapshot was read.
    pub timestamp: DateTime<Utc>,
    /// Connection state at the time of the poll.
    pub state: DeviceState,
    /// Instrument-family-specific readings.
    pub telemetry: Telemetry,
}

/// Structured telemetry, typed per instrument family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Telemetry {
    /// Syringe/continuous-flow pump.
    Pump {
        /// Current flow rate in µL/min (negative while aspirating).
        flow_rate_ul_min: f64,
        /// Whether the motor is currently turning.
        is_moving: bool,
    },
    /// Thermal/Coriolis flow meter.
    FlowMeter {
        /// Measured flow rate in the meter's selected units.
        flow_rate: f64,
        /// The selected units, e.g. "uL/min".
        units: String,
        /// Fluid density reading, g/L.
        density: f64,
        /// Sensor temperature, °C.
        temperature_c: f64,
    },
    /// Motorized stage axis.
    Motor {
        /// Current position in mm.
        position: f64,
        /// Whether the axis is in motion.
        moving: bool,
    },
    /// Detector scaler channel.
    Scaler {
        /// Counts accumulated over the last gate.
        counts: f64,
        /// Gate (dwell) time in seconds.
        dwell_s: f64,
    },
    /// Anything else.
    Generic(serde_json::Value),
}

/// Everything a subscriber can observe about one device.
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    /// Outcome of a command (also delivered to the submitting caller).
    Result(CommandResult),
    /// Periodic telemetry from idle polling or an explicit status query.
    Status(StatusUpdate),
}

// =============================================================================
// Lifecycle States
// =============================================================================

/// Connection state of an open device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Transport closed (after an explicit `Disconnect`).
    Disconnected,
    /// Transport being established.
    Connecting,
    /// Transport up, commands accepted.
    Connected,
    /// Too many consecutive failures; commands rejected until reconnect.
    Error,
}

/// Observable state of a device's control worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Waiting for commands or the next poll tick.
    Idle,
    /// Running a dequeued command against the driver.
    Executing,
    /// Running an idle status poll.
    Polling,
    /// Shutdown requested; draining.
    Stopping,
    /// Loop exited, driver disconnected.
    Stopped,
}

// =============================================================================
// Device Driver Trait
// =============================================================================

/// Instrument family implemented by a driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Syringe/continuous-flow pump.
    Pump,
    /// Flow meter.
    FlowMeter,
    /// Motorized stage axis.
    Motor,
    /// Detector scaler.
    Scaler,
    /// Test double.
    Mock,
}

/// One physical device's command vocabulary and wire encoding/decoding.
///
/// A driver owns its transport and its instrument's protocol; it holds no
/// locks because it is only ever called from the single control worker that
/// owns it. Drivers are `Send` (they move into the worker task) but need
/// not be `Sync`.
///
/// `connect` failures surface as [`DeviceError::Connection`]; malformed or
/// unexpected responses as [`DeviceError::Protocol`]. Transport timeouts
/// are enforced above the driver by the worker, and inside it by the
/// transport's own read deadline.
#[async_trait]
pub trait DeviceDriver: Send {
    /// Which instrument family this driver speaks for.
    fn kind(&self) -> DeviceKind;

    /// Open the transport and prepare the instrument for use.
    async fn connect(&mut self) -> DeviceResult<()>;

    /// Close the transport. Must be safe to call when already closed.
    async fn disconnect(&mut self) -> DeviceResult<()>;

    /// Execute one operation and return its payload.
    async fn execute(&mut self, operation: &Operation) -> DeviceResult<ResponsePayload>;

    /// Read-only telemetry snapshot, used by idle polling and `QueryStatus`.
    async fn read_status(&mut self) -> DeviceResult<Telemetry>;
}

impl std::fmt::Debug for dyn DeviceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDriver")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Fallback `execute` handling for operations a driver family does not
/// support. Keeps the per-driver match arms focused on what the instrument
/// can actually do.
pub fn unsupported(kind: DeviceKind, operation: &Operation) -> DeviceError {
    DeviceError::Protocol(format!(
        "operation '{}' is not supported by {:?} devices",
        operation.label(),
        kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_are_unique() {
        let a = Command::new("pumpA", Operation::Stop);
        let b = Command::new("pumpA", Operation::Stop);
        assert_ne!(a.id, b.id);
        assert_eq!(a.device, "pumpA");
    }

    #[test]
    fn operation_labels() {
        assert_eq!(Operation::QueryStatus.label(), "query-status");
        assert_eq!(Operation::Dispense { volume_ul: 10.0 }.label(), "dispense");
    }

    #[test]
    fn result_success_flag() {
        let ok = CommandResult {
            id: Uuid::new_v4(),
            device: "fm1".into(),
            result: Ok(ResponsePayload::None),
            finished_at: Utc::now(),
        };
        assert!(ok.success());

        let err = CommandResult {
            id: Uuid::new_v4(),
            device: "fm1".into(),
            result: Err(DeviceError::Cancelled),
            finished_at: Utc::now(),
        };
        assert!(!err.success());
    }
}
