//! Configuration loading using Figment.
//!
//! Settings are loaded from a TOML file merged with environment variables
//! (prefixed with `LABCON_`), then validated. Durations are written in
//! human-readable form (`"500ms"`, `"2s"`) via `humantime-serde`.
//!
//! # Example
//! ```toml
//! [application]
//! name = "labcon"
//! log_level = "info"
//!
//! [control]
//! poll_interval = "1s"
//! command_timeout = "3s"
//! queue_capacity = 32
//!
//! [[devices]]
//! name = "pumpA"
//! type = "m50_pump"
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! [devices.params]
//! flow_cal = 626.2
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DeviceError;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings.
    pub application: ApplicationSettings,
    /// Control worker and queue settings.
    #[serde(default)]
    pub control: ControlSettings,
    /// Device definitions.
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
    /// Optional 2D scan definition used by the `scan` subcommand.
    #[serde(default)]
    pub scan: Option<ScanSettings>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// How `submit` behaves when a device's command queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitPolicy {
    /// Wait for space; user commands are never dropped.
    Block,
    /// Fail fast with `QueueFull`.
    Fail,
}

/// Tuning for the per-device control workers and queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Idle status-poll interval.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Per-operation device I/O timeout.
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Bound on each device's command queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Behavior when the queue bound is hit.
    #[serde(default = "default_submit_policy")]
    pub submit_policy: SubmitPolicy,
    /// Retries for a timed-out operation before it fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive transport failures before the device enters the error
    /// state.
    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,
    /// How long `close` waits for a worker to drain before aborting it.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Capacity of each device's event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// One device entry in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name (the registry key).
    pub name: String,
    /// Driver type (e.g. "m50_pump", "bfs", "motor", "scaler", "mock").
    pub r#type: String,
    /// Serial port path, where applicable (e.g. "/dev/ttyUSB0", "COM3").
    #[serde(default)]
    pub port: Option<String>,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Driver-specific parameters (dynamic).
    #[serde(default)]
    pub params: serde_json::Value,
}

/// 2D grid scan definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Device name of the fast (inner) axis motor.
    pub x_motor: String,
    /// Device name of the slow (outer) axis motor.
    pub y_motor: String,
    /// Fast axis start position.
    pub x_start: f64,
    /// Fast axis step size.
    pub x_step: f64,
    /// Fast axis end position.
    pub x_end: f64,
    /// Slow axis start position.
    pub y_start: f64,
    /// Slow axis step size.
    pub y_step: f64,
    /// Slow axis end position.
    pub y_end: f64,
    /// Device names of the scaler channels to read at each point.
    pub scalers: Vec<String>,
    /// Counting (gate) time at each point.
    #[serde(with = "humantime_serde", default = "default_dwell")]
    pub dwell: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            command_timeout: default_command_timeout(),
            queue_capacity: default_queue_capacity(),
            submit_policy: default_submit_policy(),
            max_retries: default_max_retries(),
            fault_threshold: default_fault_threshold(),
            shutdown_timeout: default_shutdown_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

// Default value functions
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_queue_capacity() -> usize {
    32
}

fn default_submit_policy() -> SubmitPolicy {
    SubmitPolicy::Block
}

fn default_max_retries() -> u32 {
    1
}

fn default_fault_threshold() -> u32 {
    3
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_event_buffer() -> usize {
    256
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_dwell() -> Duration {
    Duration::from_millis(100)
}

impl Settings {
    /// Load configuration from a TOML file merged with `LABCON_`-prefixed
    /// environment variables.
    ///
    /// Example override: `LABCON_APPLICATION_LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCON_").split("_"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), DeviceError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DeviceError::Config(format!(
                "invalid log_level '{}'; must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.control.queue_capacity == 0 {
            return Err(DeviceError::Config(
                "queue_capacity must be at least 1".into(),
            ));
        }

        if self.control.event_buffer == 0 {
            return Err(DeviceError::Config("event_buffer must be at least 1".into()));
        }

        if self.control.fault_threshold == 0 {
            return Err(DeviceError::Config(
                "fault_threshold must be at least 1".into(),
            ));
        }

        // Device names are the registry primary key
        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(DeviceError::Config("device name must not be empty".into()));
            }
            if !names.insert(&device.name) {
                return Err(DeviceError::Config(format!(
                    "duplicate device name: {}",
                    device.name
                )));
            }
        }

        if let Some(scan) = &self.scan {
            scan.validate()?;
            for required in [&scan.x_motor, &scan.y_motor]
                .into_iter()
                .chain(scan.scalers.iter())
            {
                if !names.contains(required) {
                    return Err(DeviceError::Config(format!(
                        "scan references unknown device '{required}'"
                    )));
                }
            }
        }

        Ok(())
    }
}

impl ScanSettings {
    /// Number of points along the fast axis.
    pub fn x_steps(&self) -> usize {
        axis_steps(self.x_start, self.x_step, self.x_end)
    }

    /// Number of rows along the slow axis.
    pub fn y_steps(&self) -> usize {
        axis_steps(self.y_start, self.y_step, self.y_end)
    }

    /// Semantic checks independent of the device list.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.x_step == 0.0 || self.y_step == 0.0 {
            return Err(DeviceError::Config("scan step must be non-zero".into()));
        }
        if (self.x_end - self.x_start) * self.x_step < 0.0
            || (self.y_end - self.y_start) * self.y_step < 0.0
        {
            return Err(DeviceError::Config(
                "scan step direction must point from start toward end".into(),
            ));
        }
        if self.scalers.is_empty() {
            return Err(DeviceError::Config(
                "scan requires at least one scaler".into(),
            ));
        }
        Ok(())
    }
}

/// Inclusive step count along one axis: floor((end - start) / step) + 1.
fn axis_steps(start: f64, step: f64, end: f64) -> usize {
    ((end - start) / step).floor() as usize + 1
}
