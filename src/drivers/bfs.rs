//! BFS flow-meter driver (Bronkhorst/Elveflow BFS).
//!
//! The BFS reports thermal-mass flow, fluid density, and sensor
//! temperature. The instrument always measures in its base units (µL/min);
//! a selectable display unit rescales readings without changing the
//! physical rate. The smoothing filter is a factor in (0, 1]: 1 applies
//! minimal filtering, values toward 0 smooth harder.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::core::{DeviceDriver, DeviceKind, Operation, ResponsePayload, Telemetry, unsupported};
use crate::drivers::transport::Transport;
use crate::error::{DeviceError, DeviceResult};

/// Volume-per-time unit accepted by the flow-rate display conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowUnits {
    volume: VolumeUnit,
    time: TimeUnit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VolumeUnit {
    NanoLiter,
    MicroLiter,
    MilliLiter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimeUnit {
    Second,
    Minute,
}

impl FlowUnits {
    /// The BFS's native reporting units.
    pub const BASE: FlowUnits = FlowUnits {
        volume: VolumeUnit::MicroLiter,
        time: TimeUnit::Minute,
    };

    /// Multiplier converting a rate in `self` units to `target` units.
    pub fn conversion_to(self, target: FlowUnits) -> f64 {
        let volume_factor = self.volume.liters() / target.volume.liters();
        let time_factor = target.time.seconds() / self.time.seconds();
        volume_factor * time_factor
    }
}

impl VolumeUnit {
    fn liters(self) -> f64 {
        match self {
            VolumeUnit::NanoLiter => 1e-9,
            VolumeUnit::MicroLiter => 1e-6,
            VolumeUnit::MilliLiter => 1e-3,
        }
    }
}

impl TimeUnit {
    fn seconds(self) -> f64 {
        match self {
            TimeUnit::Second => 1.0,
            TimeUnit::Minute => 60.0,
        }
    }
}

impl FromStr for FlowUnits {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            || DeviceError::Protocol(format!("invalid flow units '{s}'; expected e.g. 'uL/min'"));
        let (volume, time) = s.split_once('/').ok_or_else(invalid)?;
        let volume = match volume {
            "nL" => VolumeUnit::NanoLiter,
            "uL" => VolumeUnit::MicroLiter,
            "mL" => VolumeUnit::MilliLiter,
            _ => return Err(invalid()),
        };
        let time = match time {
            "s" => TimeUnit::Second,
            "min" => TimeUnit::Minute,
            _ => return Err(invalid()),
        };
        Ok(FlowUnits { volume, time })
    }
}

impl fmt::Display for FlowUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let volume = match self.volume {
            VolumeUnit::NanoLiter => "nL",
            VolumeUnit::MicroLiter => "uL",
            VolumeUnit::MilliLiter => "mL",
        };
        let time = match self.time {
            TimeUnit::Second => "s",
            TimeUnit::Minute => "min",
        };
        write!(f, "{volume}/{time}")
    }
}

/// Driver for a BFS flow meter.
pub struct BfsFlowMeter<T: Transport> {
    transport: T,
    /// Smoothing factor in (0, 1]; 1 = minimum filtering.
    filter: f64,
    /// Selected display units.
    units: FlowUnits,
    /// Cached base → display multiplier.
    multiplier: f64,
}

impl<T: Transport> BfsFlowMeter<T> {
    /// Create a flow-meter driver with the given smoothing filter.
    pub fn new(transport: T, filter: f64) -> Self {
        Self {
            transport,
            filter,
            units: FlowUnits::BASE,
            multiplier: 1.0,
        }
    }

    /// The transport under this driver (test inspection).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Currently selected display units.
    pub fn units(&self) -> FlowUnits {
        self.units
    }

    fn set_units(&mut self, units: FlowUnits) {
        self.units = units;
        self.multiplier = FlowUnits::BASE.conversion_to(units);
    }

    async fn apply_filter(&mut self) -> DeviceResult<()> {
        if !(self.filter > 0.0 && self.filter <= 1.0) {
            return Err(DeviceError::Protocol(format!(
                "filter must be in (0, 1], got {}",
                self.filter
            )));
        }
        self.transport.send(&format!("FILT {}", self.filter)).await
    }

    async fn query_value(&mut self, query: &str) -> DeviceResult<f64> {
        let response = self.transport.exchange(query).await?;
        response.trim().parse::<f64>().map_err(|_| {
            DeviceError::Protocol(format!("non-numeric response '{response}' to '{query}'"))
        })
    }

    /// Flow rate in the selected display units.
    async fn flow_rate(&mut self) -> DeviceResult<f64> {
        Ok(self.query_value("FLOW?").await? * self.multiplier)
    }
}

#[async_trait]
impl<T: Transport + 'static> DeviceDriver for BfsFlowMeter<T> {
    fn kind(&self) -> DeviceKind {
        DeviceKind::FlowMeter
    }

    async fn connect(&mut self) -> DeviceResult<()> {
        self.transport.open().await?;
        self.apply_filter().await
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.transport.close().await
    }

    async fn execute(&mut self, operation: &Operation) -> DeviceResult<ResponsePayload> {
        match operation {
            // Nothing runs continuously on a meter; stop is a harmless no-op
            // so callers can blanket-stop a device group.
            Operation::Stop => Ok(ResponsePayload::None),
            Operation::SetParameter { name, value } => match name.as_str() {
                "units" => {
                    let text = value.as_str().ok_or_else(|| {
                        DeviceError::Protocol("units must be a string like 'uL/min'".into())
                    })?;
                    self.set_units(text.parse()?);
                    Ok(ResponsePayload::Text(self.units.to_string()))
                }
                "filter" => {
                    let filter = value.as_f64().ok_or_else(|| {
                        DeviceError::Protocol("filter must be a number in (0, 1]".into())
                    })?;
                    self.filter = filter;
                    self.apply_filter().await?;
                    Ok(ResponsePayload::Scalar {
                        value: self.filter,
                        unit: String::new(),
                    })
                }
                other => Err(DeviceError::Protocol(format!(
                    "unknown flow-meter parameter '{other}'"
                ))),
            },
            Operation::Custom { name, .. } => match name.as_str() {
                "flow" => {
                    let value = self.flow_rate().await?;
                    Ok(ResponsePayload::Scalar {
                        value,
                        unit: self.units.to_string(),
                    })
                }
                "density" => {
                    let value = self.query_value("DENS?").await?;
                    Ok(ResponsePayload::Scalar {
                        value,
                        unit: "g/L".into(),
                    })
                }
                "temperature" => {
                    let value = self.query_value("TEMP?").await?;
                    Ok(ResponsePayload::Scalar {
                        value,
                        unit: "degC".into(),
                    })
                }
                other => Err(DeviceError::Protocol(format!(
                    "unknown flow-meter query '{other}'"
                ))),
            },
            other => Err(unsupported(DeviceKind::FlowMeter, other)),
        }
    }

    async fn read_status(&mut self) -> DeviceResult<Telemetry> {
        let flow_rate = self.flow_rate().await?;
        let density = self.query_value("DENS?").await?;
        let temperature_c = self.query_value("TEMP?").await?;
        Ok(Telemetry::FlowMeter {
            flow_rate,
            units: self.units.to_string(),
            density,
            temperature_c,
        })
    }
}
