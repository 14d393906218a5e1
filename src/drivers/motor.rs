//! Stage motor and detector scaler drivers.
//!
//! These are the two device families the mapping tool drives: motorized
//! stage axes positioned point-by-point, and scaler channels that
//! accumulate detector counts over a preset gate (dwell) time. Both speak a
//! line protocol over the generic transport, which stands in for whatever
//! instrument-control bus actually carries them.
//!
//! A `Move` completes only when the axis reports settled, so a caller
//! awaiting the command result can immediately trust the position. The
//! overall bound on a slow or stuck move is the worker's per-command
//! timeout.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::{DeviceDriver, DeviceKind, Operation, ResponsePayload, Telemetry, unsupported};
use crate::drivers::transport::Transport;
use crate::error::{DeviceError, DeviceResult};

/// How often a settling move re-polls the moving flag.
const SETTLE_POLL: Duration = Duration::from_millis(20);

/// Driver for one motorized stage axis.
pub struct StageMotor<T: Transport> {
    transport: T,
}

impl<T: Transport> StageMotor<T> {
    /// Create a stage-axis driver.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// The transport under this driver (test inspection).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn position(&mut self) -> DeviceResult<f64> {
        parse_number(&self.transport.exchange("POS?").await?, "POS?")
    }

    async fn is_moving(&mut self) -> DeviceResult<bool> {
        match self.transport.exchange("MV?").await?.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(DeviceError::Protocol(format!(
                "unexpected moving-flag response '{other}'"
            ))),
        }
    }

    /// Command an absolute move and wait until the axis settles.
    async fn move_absolute(&mut self, target: f64) -> DeviceResult<f64> {
        self.transport.send(&format!("MOVE {target}")).await?;
        loop {
            if !self.is_moving().await? {
                return self.position().await;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> DeviceDriver for StageMotor<T> {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Motor
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        self.transport.open().await
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.transport.close().await
    }

    async fn execute(&mut self, operation: &Operation) -> DeviceResult<ResponsePayload> {
        match operation {
            Operation::Move { target } => {
                let position = self.move_absolute(*target).await?;
                Ok(ResponsePayload::Scalar {
                    value: position,
                    unit: "mm".into(),
                })
            }
            Operation::Stop => {
                self.transport.send("STOP").await?;
                Ok(ResponsePayload::None)
            }
            Operation::SetParameter { name, value } => match name.as_str() {
                "velocity" => {
                    let velocity = value.as_f64().ok_or_else(|| {
                        DeviceError::Protocol("velocity must be a number (mm/s)".into())
                    })?;
                    self.transport.send(&format!("VEL {velocity}")).await?;
                    Ok(ResponsePayload::Scalar {
                        value: velocity,
                        unit: "mm/s".into(),
                    })
                }
                other => Err(DeviceError::Protocol(format!(
                    "unknown motor parameter '{other}'"
                ))),
            },
            other => Err(unsupported(DeviceKind::Motor, other)),
        }
    }

    async fn read_status(&mut self) -> DeviceResult<Telemetry> {
        let position = self.position().await?;
        let moving = self.is_moving().await?;
        Ok(Telemetry::Motor { position, moving })
    }
}

/// Driver for one detector scaler channel.
pub struct Scaler<T: Transport> {
    transport: T,
    /// Gate time for each count.
    dwell: Duration,
    /// Most recent counts reading, reported in idle telemetry.
    last_counts: f64,
}

impl<T: Transport> Scaler<T> {
    /// Create a scaler driver with the given default gate time.
    pub fn new(transport: T, dwell: Duration) -> Self {
        Self {
            transport,
            dwell,
            last_counts: 0.0,
        }
    }

    /// The transport under this driver (test inspection).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gate the scaler for the dwell time and read the accumulated counts.
    async fn count(&mut self) -> DeviceResult<f64> {
        let dwell_s = self.dwell.as_secs_f64();
        self.transport.send(&format!("COUNT {dwell_s}")).await?;
        tokio::time::sleep(self.dwell).await;
        let counts = parse_number(&self.transport.exchange("CNTS?").await?, "CNTS?")?;
        self.last_counts = counts;
        Ok(counts)
    }
}

#[async_trait]
impl<T: Transport + 'static> DeviceDriver for Scaler<T> {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Scaler
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        self.transport.open().await
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.transport.close().await
    }

    async fn execute(&mut self, operation: &Operation) -> DeviceResult<ResponsePayload> {
        match operation {
            Operation::Custom { name, .. } if name == "count" => {
                let counts = self.count().await?;
                Ok(ResponsePayload::Scalar {
                    value: counts,
                    unit: "counts".into(),
                })
            }
            Operation::SetParameter { name, value } => match name.as_str() {
                "dwell" => {
                    let dwell_s = value.as_f64().filter(|v| *v > 0.0).ok_or_else(|| {
                        DeviceError::Protocol("dwell must be a positive number of seconds".into())
                    })?;
                    self.dwell = Duration::from_secs_f64(dwell_s);
                    Ok(ResponsePayload::Scalar {
                        value: dwell_s,
                        unit: "s".into(),
                    })
                }
                other => Err(DeviceError::Protocol(format!(
                    "unknown scaler parameter '{other}'"
                ))),
            },
            other => Err(unsupported(DeviceKind::Scaler, other)),
        }
    }

    async fn read_status(&mut self) -> DeviceResult<Telemetry> {
        Ok(Telemetry::Scaler {
            counts: self.last_counts,
            dwell_s: self.dwell.as_secs_f64(),
        })
    }
}

fn parse_number(response: &str, query: &str) -> DeviceResult<f64> {
    response.trim().parse::<f64>().map_err(|_| {
        DeviceError::Protocol(format!("non-numeric response '{response}' to '{query}'"))
    })
}
