//! Mock device driver for tests and hardware-free development.
//!
//! Simulates any instrument family with configurable execution latency and
//! failure injection, and keeps a shared log of executed operations with
//! start/finish timestamps so tests can assert ordering and overlap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::core::{DeviceDriver, DeviceKind, Operation, ResponsePayload, Telemetry};
use crate::error::{DeviceError, DeviceResult};

/// One executed operation with its execution window.
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    /// Operation label (e.g. "move", "dispense").
    pub operation: String,
    /// When the driver began executing.
    pub started_at: DateTime<Utc>,
    /// When the driver finished.
    pub finished_at: DateTime<Utc>,
}

/// Shared, test-visible log of everything a mock device executed.
pub type ExecutionLog = Arc<Mutex<Vec<ExecutionRecord>>>;

/// Simulated instrument covering every device family.
pub struct MockDevice {
    kind: DeviceKind,
    /// Applied to the first `slow_executes` operations.
    latency: Duration,
    slow_executes: u32,
    fail_connects: u32,
    fail_executes: u32,
    connected: bool,
    position: f64,
    log: ExecutionLog,
}

impl MockDevice {
    /// Create a mock of the given family.
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            latency: Duration::ZERO,
            slow_executes: 0,
            fail_connects: 0,
            fail_executes: 0,
            connected: false,
            position: 0.0,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mock syringe pump.
    pub fn pump() -> Self {
        Self::new(DeviceKind::Pump)
    }

    /// Mock flow meter.
    pub fn flow_meter() -> Self {
        Self::new(DeviceKind::FlowMeter)
    }

    /// Mock stage axis.
    pub fn motor() -> Self {
        Self::new(DeviceKind::Motor)
    }

    /// Mock scaler channel.
    pub fn scaler() -> Self {
        Self::new(DeviceKind::Scaler)
    }

    /// Mock whose connect always fails.
    pub fn failing_connect() -> Self {
        let mut mock = Self::new(DeviceKind::Mock);
        mock.fail_connects = u32::MAX;
        mock
    }

    /// Apply `latency` to every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self.slow_executes = u32::MAX;
        self
    }

    /// Apply `latency` only to the first `count` operations.
    pub fn with_slow_executes(mut self, count: u32, latency: Duration) -> Self {
        self.latency = latency;
        self.slow_executes = count;
        self
    }

    /// Fail the first `count` operations with a connection error.
    pub fn with_failing_executes(mut self, count: u32) -> Self {
        self.fail_executes = count;
        self
    }

    /// Fail the first `count` connect attempts.
    pub fn with_failing_connects(mut self, count: u32) -> Self {
        self.fail_connects = count;
        self
    }

    /// Clone of the shared execution log handle.
    pub fn log(&self) -> ExecutionLog {
        self.log.clone()
    }

    fn record(&self, operation: &Operation, started_at: DateTime<Utc>) {
        if let Ok(mut log) = self.log.lock() {
            log.push(ExecutionRecord {
                operation: operation.label().to_string(),
                started_at,
                finished_at: Utc::now(),
            });
        }
    }
}

#[async_trait]
impl DeviceDriver for MockDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        if self.fail_connects > 0 {
            self.fail_connects = self.fail_connects.saturating_sub(1);
            return Err(DeviceError::Connection("mock connect failure".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn execute(&mut self, operation: &Operation) -> DeviceResult<ResponsePayload> {
        if !self.connected {
            return Err(DeviceError::Connection("mock device not connected".into()));
        }

        let started_at = Utc::now();

        if self.slow_executes > 0 {
            self.slow_executes = self.slow_executes.saturating_sub(1);
            tokio::time::sleep(self.latency).await;
        }

        if self.fail_executes > 0 {
            self.fail_executes -= 1;
            return Err(DeviceError::Connection("mock execute failure".into()));
        }

        self.record(operation, started_at);

        match operation {
            Operation::Move { target } => {
                self.position = *target;
                Ok(ResponsePayload::Scalar {
                    value: self.position,
                    unit: "mm".into(),
                })
            }
            Operation::Start
            | Operation::Stop
            | Operation::Dispense { .. }
            | Operation::Aspirate { .. } => Ok(ResponsePayload::None),
            Operation::SetParameter { value, .. } => Ok(ResponsePayload::Json(value.clone())),
            Operation::Custom { name, .. } if name == "count" => {
                let counts = rand::thread_rng().gen_range(900.0..1100.0);
                Ok(ResponsePayload::Scalar {
                    value: counts,
                    unit: "counts".into(),
                })
            }
            Operation::Custom { name, .. } => Ok(ResponsePayload::Text(format!("ack:{name}"))),
            Operation::Connect | Operation::Disconnect | Operation::QueryStatus => {
                // Routed to connect/disconnect/read_status by the worker;
                // reaching execute() with one of these is a harness bug.
                Err(DeviceError::Protocol(
                    "lifecycle operation routed to execute()".into(),
                ))
            }
        }
    }

    async fn read_status(&mut self) -> DeviceResult<Telemetry> {
        if !self.connected {
            return Err(DeviceError::Connection("mock device not connected".into()));
        }

        let mut rng = rand::thread_rng();
        Ok(match self.kind {
            DeviceKind::Pump => Telemetry::Pump {
                flow_rate_ul_min: 1000.0 * (1.0 + rng.gen_range(-0.05..0.05)),
                is_moving: false,
            },
            DeviceKind::FlowMeter => Telemetry::FlowMeter {
                flow_rate: 120.0 * (1.0 + rng.gen_range(-0.05..0.05)),
                units: "uL/min".into(),
                density: 998.0,
                temperature_c: 21.0 + rng.gen_range(-0.5..0.5),
            },
            DeviceKind::Motor => Telemetry::Motor {
                position: self.position,
                moving: false,
            },
            DeviceKind::Scaler => Telemetry::Scaler {
                counts: rng.gen_range(900.0..1100.0),
                dwell_s: 0.1,
            },
            DeviceKind::Mock => Telemetry::Generic(serde_json::json!({ "ok": true })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_requires_connect() {
        let mut mock = MockDevice::pump();
        let err = mock
            .execute(&Operation::Start)
            .await
            .expect_err("not connected");
        assert!(matches!(err, DeviceError::Connection(_)));
    }

    #[tokio::test]
    async fn move_updates_reported_position() {
        let mut mock = MockDevice::motor();
        mock.connect().await.expect("connect");
        mock.execute(&Operation::Move { target: 4.2 })
            .await
            .expect("move");
        match mock.read_status().await.expect("status") {
            Telemetry::Motor { position, .. } => assert_eq!(position, 4.2),
            other => panic!("unexpected telemetry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_injection_is_consumed() {
        let mut mock = MockDevice::pump().with_failing_executes(1);
        mock.connect().await.expect("connect");
        assert!(mock.execute(&Operation::Start).await.is_err());
        assert!(mock.execute(&Operation::Start).await.is_ok());
    }

    #[tokio::test]
    async fn execution_log_records_windows() {
        let mut mock = MockDevice::pump();
        let log = mock.log();
        mock.connect().await.expect("connect");
        mock.execute(&Operation::Dispense { volume_ul: 5.0 })
            .await
            .expect("dispense");

        let log = log.lock().expect("log lock");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, "dispense");
        assert!(log[0].finished_at >= log[0].started_at);
    }
}
