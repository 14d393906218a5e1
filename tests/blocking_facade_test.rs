//! The blocking facade drives the same async core from synchronous code.

use labcon::config::{ControlSettings, DeviceDefinition};
use labcon::core::{DeviceEvent, Operation, ResponsePayload};
use labcon::facade::{BlockingFacade, DeviceFacade};

fn mock_definition(name: &str) -> DeviceDefinition {
    DeviceDefinition {
        name: name.into(),
        r#type: "mock".into(),
        port: None,
        baud_rate: 9600,
        params: serde_json::json!({ "family": "pump" }),
    }
}

#[test]
fn blocking_facade_round_trip() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    let facade = DeviceFacade::new(ControlSettings::default());
    let blocking = BlockingFacade::new(runtime.handle().clone(), facade);

    blocking
        .connect(&mock_definition("pumpA"))
        .expect("connect");

    let mut events = blocking.subscribe("pumpA").expect("subscribe");

    let payload = blocking
        .send_wait("pumpA", Operation::Dispense { volume_ul: 10.0 })
        .expect("dispense");
    assert!(matches!(payload, ResponsePayload::None));

    // The result is also observable on the event stream, synchronously.
    loop {
        match events.blocking_recv().expect("event") {
            DeviceEvent::Result(result) => {
                assert!(result.success());
                break;
            }
            DeviceEvent::Status(_) => {}
        }
    }

    let id = blocking
        .send("pumpA", Operation::Stop)
        .expect("async submit from sync code");
    assert!(!id.is_nil());

    blocking.disconnect("pumpA").expect("disconnect");
    blocking.shutdown();
}
