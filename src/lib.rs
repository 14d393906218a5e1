//! # labcon Core Library
//!
//! Core library for the `labcon` application: interactive control of
//! laboratory instruments (syringe pumps, flow meters) over serial links,
//! plus a 2D scanning engine driving stage motors and detector scalers.
//! Organizing the project as a library keeps the control core shared
//! between the CLI binary and any embedding frontend.
//!
//! The heart of the crate is the per-device control worker: every open
//! device is owned by one background task that serializes commands onto the
//! single connection, multiplexes command/response exchanges with idle
//! status polling, and publishes results and telemetry to any number of
//! subscribers.
//!
//! ## Crate Structure
//!
//! - **`core`**: the fundamental types and traits — `Command`,
//!   `CommandResult`, `StatusUpdate`, lifecycle states, and the
//!   `DeviceDriver` trait every instrument implements.
//! - **`config`**: figment-based settings loading and validation.
//! - **`error`**: the `DeviceError` taxonomy shared by every layer.
//! - **`queue`**: the bounded per-device command queue with cancellation.
//! - **`worker`**: the control worker that exclusively owns a device's
//!   connection.
//! - **`sink`**: the per-device event broadcast (results + telemetry).
//! - **`registry`**: lifecycle and name-routing authority for open devices.
//! - **`facade`**: the caller API (async and blocking access modes).
//! - **`drivers`**: transport boundary and concrete instrument drivers
//!   (M50 pump, BFS flow meter, stage motor, scaler, mocks).
//! - **`scan`**: the 2D grid scan engine, a facade caller like any other.
//! - **`logging`**: tracing initialization from settings.

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod facade;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod scan;
pub mod sink;
pub mod worker;

pub use crate::config::Settings;
pub use crate::core::{
    Command, CommandId, CommandResult, DeviceDriver, DeviceEvent, DeviceKind, DeviceState,
    Operation, ResponsePayload, StatusUpdate, Telemetry, WorkerState,
};
pub use crate::error::{DeviceError, DeviceResult};
pub use crate::facade::{BlockingFacade, DeviceFacade};
pub use crate::registry::DeviceRegistry;
pub use crate::scan::{ScanEngine, ScanEvent, ScanGrid, ScanPoint};
