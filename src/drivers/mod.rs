//! Device drivers: one module per instrument family, plus the transport
//! boundary they all share.
//!
//! Drivers are constructed from configuration entries by [`build_driver`],
//! which maps the `type` string to a concrete driver over a serial
//! transport (or a mock). Everything a driver needs beyond the port lives
//! in the entry's free-form `params` table.

pub mod bfs;
pub mod m50;
pub mod mock;
pub mod motor;
pub mod transport;

use std::time::Duration;

use crate::config::DeviceDefinition;
use crate::core::{DeviceDriver, DeviceKind};
use crate::error::{DeviceError, DeviceResult};

pub use bfs::{BfsFlowMeter, FlowUnits};
pub use m50::M50Pump;
pub use mock::MockDevice;
pub use motor::{Scaler, StageMotor};
pub use transport::{MockTransport, SerialTransport, Transport};

/// Build a driver from a device configuration entry.
///
/// Known types: `m50_pump`, `bfs`, `motor`, `scaler`, `mock`.
pub fn build_driver(definition: &DeviceDefinition) -> DeviceResult<Box<dyn DeviceDriver>> {
    match definition.r#type.as_str() {
        "m50_pump" => {
            let transport = serial_transport(definition)?;
            let flow_cal = param_f64(definition, "flow_cal").unwrap_or(628.0);
            let backlash_cal = param_f64(definition, "backlash_cal").unwrap_or(1.5);
            Ok(Box::new(M50Pump::new(transport, flow_cal, backlash_cal)))
        }
        "bfs" => {
            let transport = serial_transport(definition)?;
            let filter = param_f64(definition, "filter").unwrap_or(1.0);
            Ok(Box::new(BfsFlowMeter::new(transport, filter)))
        }
        "motor" => {
            let transport = serial_transport(definition)?;
            Ok(Box::new(StageMotor::new(transport)))
        }
        "scaler" => {
            let transport = serial_transport(definition)?;
            let dwell_s = param_f64(definition, "dwell").unwrap_or(0.1);
            Ok(Box::new(Scaler::new(
                transport,
                Duration::from_secs_f64(dwell_s),
            )))
        }
        "mock" => {
            let kind = match param_str(definition, "family").as_deref() {
                Some("pump") => DeviceKind::Pump,
                Some("flow_meter") => DeviceKind::FlowMeter,
                Some("motor") => DeviceKind::Motor,
                Some("scaler") => DeviceKind::Scaler,
                Some(other) => {
                    return Err(DeviceError::Config(format!(
                        "unknown mock family '{other}' for device '{}'",
                        definition.name
                    )))
                }
                None => DeviceKind::Mock,
            };
            Ok(Box::new(MockDevice::new(kind)))
        }
        other => Err(DeviceError::Config(format!(
            "unknown device type '{other}' for device '{}'",
            definition.name
        ))),
    }
}

fn serial_transport(definition: &DeviceDefinition) -> DeviceResult<SerialTransport> {
    let port = definition.port.as_ref().ok_or_else(|| {
        DeviceError::Config(format!(
            "device '{}' of type '{}' requires a serial port",
            definition.name, definition.r#type
        ))
    })?;
    Ok(SerialTransport::new(port, definition.baud_rate))
}

fn param_f64(definition: &DeviceDefinition, key: &str) -> Option<f64> {
    definition.params.get(key).and_then(|v| v.as_f64())
}

fn param_str(definition: &DeviceDefinition, key: &str) -> Option<String> {
    definition
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(kind: &str, port: Option<&str>) -> DeviceDefinition {
        DeviceDefinition {
            name: "dev1".into(),
            r#type: kind.into(),
            port: port.map(str::to_string),
            baud_rate: 9600,
            params: serde_json::Value::Null,
        }
    }

    #[test]
    fn builds_known_types() {
        for kind in ["m50_pump", "bfs", "motor", "scaler"] {
            let driver = build_driver(&definition(kind, Some("/dev/ttyUSB0")))
                .unwrap_or_else(|err| panic!("{kind}: {err}"));
            drop(driver);
        }
        assert!(build_driver(&definition("mock", None)).is_ok());
    }

    #[test]
    fn serial_types_require_a_port() {
        let err = build_driver(&definition("m50_pump", None)).expect_err("no port");
        assert!(matches!(err, DeviceError::Config(_)));
    }

    #[test]
    fn unknown_type_rejected() {
        let err = build_driver(&definition("hplc", Some("/dev/ttyUSB0"))).expect_err("unknown");
        assert!(matches!(err, DeviceError::Config(_)));
    }

    #[test]
    fn mock_family_selected_from_params() {
        let mut def = definition("mock", None);
        def.params = serde_json::json!({ "family": "motor" });
        let driver = build_driver(&def).expect("mock motor");
        assert_eq!(driver.kind(), DeviceKind::Motor);
    }
}
