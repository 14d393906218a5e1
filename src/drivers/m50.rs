//! VICI M50 syringe pump driver (MForce controller).
//!
//! The M50 is driven through an MForce stepper controller speaking a
//! line-oriented serial protocol. Flow is expressed on the wire in
//! microsteps: with 256x microstepping the controller sees 51200 steps per
//! revolution, and the pump head's flow calibration (µL per revolution)
//! converts between volume and steps.
//!
//! Rate limits are physical: 25 mL/min maximum continuous flow, 1 µL/min
//! minimum controllable rate. Set-points outside those bounds are clamped,
//! not rejected.

use async_trait::async_trait;

use crate::core::{
    DeviceDriver, DeviceKind, Operation, ResponsePayload, Telemetry, unsupported,
};
use crate::drivers::transport::Transport;
use crate::error::{DeviceError, DeviceResult};

/// Microsteps per revolution at 256x microstepping.
const STEPS_PER_REV: f64 = 51200.0;
/// Maximum continuous flow rate magnitude, µL/min.
const MAX_FLOW_UL_MIN: f64 = 25_000.0;
/// Minimum controllable flow rate magnitude, µL/min.
const MIN_FLOW_UL_MIN: f64 = 1.0;

/// Clamp a signed flow rate (µL/min) to the pump's controllable range.
pub fn clamp_flow_rate(rate_ul_min: f64) -> f64 {
    let clamped = rate_ul_min.clamp(-MAX_FLOW_UL_MIN, MAX_FLOW_UL_MIN);
    if clamped.abs() < MIN_FLOW_UL_MIN {
        if clamped >= 0.0 {
            MIN_FLOW_UL_MIN
        } else {
            -MIN_FLOW_UL_MIN
        }
    } else {
        clamped
    }
}

/// Driver for a VICI M50 pump on an MForce controller.
pub struct M50Pump<T: Transport> {
    transport: T,
    /// Pump-head flow calibration, µL per revolution.
    flow_cal: f64,
    /// Backlash compensation volume, µL, applied on direction reversal.
    backlash_cal: f64,
    /// Signed flow-rate set-point, µL/min.
    flow_rate_ul_min: f64,
    is_flowing: bool,
    is_dispensing: bool,
    /// +1.0 or -1.0; direction of the last volume move.
    last_direction: f64,
}

impl<T: Transport> M50Pump<T> {
    /// Create a pump driver with explicit calibrations.
    pub fn new(transport: T, flow_cal: f64, backlash_cal: f64) -> Self {
        Self {
            transport,
            flow_cal,
            backlash_cal,
            flow_rate_ul_min: MIN_FLOW_UL_MIN,
            is_flowing: false,
            is_dispensing: false,
            last_direction: 1.0,
        }
    }

    /// Create a pump driver with the standard head calibration
    /// (628 µL/rev, 1.5 µL backlash).
    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, 628.0, 1.5)
    }

    /// The transport under this driver (test inspection).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Microsteps per microliter for this pump head.
    fn steps_per_ul(&self) -> f64 {
        STEPS_PER_REV / self.flow_cal
    }

    /// Flow-rate set-point converted to microsteps per second.
    fn rate_steps_per_sec(&self) -> i64 {
        (self.flow_rate_ul_min / 60.0 * self.steps_per_ul()).round() as i64
    }

    async fn set_flow_rate(&mut self, rate_ul_min: f64) -> DeviceResult<()> {
        self.flow_rate_ul_min = clamp_flow_rate(rate_ul_min);

        // Retarget immediately when already moving.
        if self.is_flowing {
            let steps = self.rate_steps_per_sec();
            self.transport.send(&format!("SL {steps}")).await?;
        } else if self.is_dispensing {
            let steps = self.rate_steps_per_sec().abs();
            self.transport.send(&format!("V {steps}")).await?;
        }
        Ok(())
    }

    async fn start_flow(&mut self) -> DeviceResult<()> {
        let steps = self.rate_steps_per_sec();
        self.transport.send(&format!("SL {steps}")).await?;
        self.is_flowing = true;
        self.is_dispensing = false;
        Ok(())
    }

    /// Move a fixed signed volume (positive dispenses, negative aspirates)
    /// at the current rate set-point.
    async fn move_volume(&mut self, volume_ul: f64) -> DeviceResult<()> {
        let direction = if volume_ul >= 0.0 { 1.0 } else { -1.0 };
        let mut volume = volume_ul;
        if direction != self.last_direction {
            volume += direction * self.backlash_cal;
            self.last_direction = direction;
        }

        let velocity = self.rate_steps_per_sec().abs();
        let steps = (volume * self.steps_per_ul()).round() as i64;
        self.transport.send(&format!("V {velocity}")).await?;
        self.transport.send(&format!("MR {steps}")).await?;
        self.is_dispensing = true;
        self.is_flowing = false;
        Ok(())
    }

    async fn stop(&mut self) -> DeviceResult<()> {
        self.transport.send("SL 0").await?;
        self.transport.send("\x1b").await?;
        self.is_flowing = false;
        self.is_dispensing = false;
        Ok(())
    }

    async fn is_moving(&mut self) -> DeviceResult<bool> {
        let response = self.transport.exchange("PR MV").await?;
        match response.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(DeviceError::Protocol(format!(
                "unexpected moving-flag response '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> DeviceDriver for M50Pump<T> {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Pump
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        self.transport.open().await?;

        // MForce controller setup. Defaults except run current, which VICI
        // specifies at 50%.
        for setup in ["MS=256", "VI=1000", "A=1000000", "D=1000000", "HC=5", "RC=50"] {
            self.transport.send(setup).await?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.transport.close().await
    }

    async fn execute(&mut self, operation: &Operation) -> DeviceResult<ResponsePayload> {
        match operation {
            Operation::Start => {
                self.start_flow().await?;
                Ok(ResponsePayload::None)
            }
            Operation::Stop => {
                self.stop().await?;
                Ok(ResponsePayload::None)
            }
            Operation::Dispense { volume_ul } => {
                self.move_volume(*volume_ul).await?;
                Ok(ResponsePayload::None)
            }
            Operation::Aspirate { volume_ul } => {
                self.move_volume(-volume_ul).await?;
                Ok(ResponsePayload::None)
            }
            Operation::SetParameter { name, value } => match name.as_str() {
                "flow_rate" => {
                    let rate = value.as_f64().ok_or_else(|| {
                        DeviceError::Protocol("flow_rate must be a number (µL/min)".into())
                    })?;
                    self.set_flow_rate(rate).await?;
                    Ok(ResponsePayload::Scalar {
                        value: self.flow_rate_ul_min,
                        unit: "uL/min".into(),
                    })
                }
                other => Err(DeviceError::Protocol(format!(
                    "unknown pump parameter '{other}'"
                ))),
            },
            other => Err(unsupported(DeviceKind::Pump, other)),
        }
    }

    async fn read_status(&mut self) -> DeviceResult<Telemetry> {
        let moving = self.is_moving().await?;
        let flow_rate = if self.is_flowing || self.is_dispensing {
            self.flow_rate_ul_min
        } else {
            0.0
        };
        Ok(Telemetry::Pump {
            flow_rate_ul_min: flow_rate,
            is_moving: moving,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::transport::MockTransport;

    fn pump() -> M50Pump<MockTransport> {
        M50Pump::with_defaults(MockTransport::new().with_response("PR MV", "1"))
    }

    #[test]
    fn flow_rate_clamping() {
        assert_eq!(clamp_flow_rate(30_000.0), 25_000.0);
        assert_eq!(clamp_flow_rate(-30_000.0), -25_000.0);
        assert_eq!(clamp_flow_rate(0.2), 1.0);
        assert_eq!(clamp_flow_rate(-0.2), -1.0);
        assert_eq!(clamp_flow_rate(500.0), 500.0);
    }

    #[tokio::test]
    async fn connect_programs_controller_defaults() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        assert_eq!(
            pump.transport().sent(),
            ["MS=256", "VI=1000", "A=1000000", "D=1000000", "HC=5", "RC=50"]
        );
    }

    #[tokio::test]
    async fn start_flow_sends_slew_at_calibrated_rate() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        pump.execute(&Operation::SetParameter {
            name: "flow_rate".into(),
            value: serde_json::json!(600.0),
        })
        .await
        .expect("set rate");
        pump.execute(&Operation::Start).await.expect("start");

        // 600 µL/min = 10 µL/s; 51200/628 ≈ 81.53 steps/µL → 815 steps/s.
        let last = pump.transport().sent().last().cloned();
        assert_eq!(last.as_deref(), Some("SL 815"));
    }

    #[tokio::test]
    async fn dispense_sends_velocity_then_relative_move() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        pump.execute(&Operation::SetParameter {
            name: "flow_rate".into(),
            value: serde_json::json!(600.0),
        })
        .await
        .expect("set rate");
        pump.execute(&Operation::Dispense { volume_ul: 10.0 })
            .await
            .expect("dispense");

        let sent = pump.transport().sent();
        let tail = &sent[sent.len() - 2..];
        assert_eq!(tail[0], "V 815");
        // 10 µL * 81.53 steps/µL ≈ 815 steps.
        assert_eq!(tail[1], "MR 815");
    }

    #[tokio::test]
    async fn aspirate_reverses_and_applies_backlash() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        // First move is positive; aspirating reverses direction, so the
        // 1.5 µL backlash is folded into the commanded volume.
        pump.execute(&Operation::Dispense { volume_ul: 10.0 })
            .await
            .expect("dispense");
        pump.execute(&Operation::Aspirate { volume_ul: 10.0 })
            .await
            .expect("aspirate");

        let sent = pump.transport().sent();
        let last = sent.last().map(String::as_str);
        // -(10 + 1.5) µL * 81.53 steps/µL ≈ -938 steps.
        assert_eq!(last, Some("MR -938"));
    }

    #[tokio::test]
    async fn stop_sends_zero_slew_and_escape() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        pump.execute(&Operation::Start).await.expect("start");
        pump.execute(&Operation::Stop).await.expect("stop");

        let sent = pump.transport().sent();
        let tail = &sent[sent.len() - 2..];
        assert_eq!(tail[0], "SL 0");
        assert_eq!(tail[1], "\x1b");
    }

    #[tokio::test]
    async fn status_reports_moving_flag_and_rate() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        pump.execute(&Operation::SetParameter {
            name: "flow_rate".into(),
            value: serde_json::json!(2_000.0),
        })
        .await
        .expect("set rate");
        pump.execute(&Operation::Start).await.expect("start");

        match pump.read_status().await.expect("status") {
            Telemetry::Pump {
                flow_rate_ul_min,
                is_moving,
            } => {
                assert_eq!(flow_rate_ul_min, 2_000.0);
                assert!(is_moving);
            }
            other => panic!("unexpected telemetry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_operation_is_a_protocol_error() {
        let mut pump = pump();
        pump.connect().await.expect("connect");
        let err = pump
            .execute(&Operation::Move { target: 1.0 })
            .await
            .expect_err("pumps do not move to positions");
        assert!(matches!(err, DeviceError::Protocol(_)));
    }
}
