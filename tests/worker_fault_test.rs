//! Integration tests for timeout handling, fault accounting, and recovery.

use std::time::Duration;

use labcon::config::ControlSettings;
use labcon::core::{DeviceEvent, Operation};
use labcon::drivers::bfs::BfsFlowMeter;
use labcon::drivers::mock::MockDevice;
use labcon::drivers::transport::MockTransport;
use labcon::error::DeviceError;
use labcon::facade::DeviceFacade;

fn tight_control(fault_threshold: u32) -> ControlSettings {
    ControlSettings {
        poll_interval: Duration::from_secs(60), // keep polls out of the way
        command_timeout: Duration::from_millis(50),
        max_retries: 0,
        fault_threshold,
        ..ControlSettings::default()
    }
}

#[tokio::test]
async fn timeout_yields_one_result_and_no_stall() {
    let facade = DeviceFacade::new(tight_control(10));

    // First operation sleeps past the 50ms command timeout; later ones are
    // instant.
    let driver = MockDevice::pump().with_slow_executes(1, Duration::from_millis(300));
    facade
        .connect_driver("pumpA", Box::new(driver))
        .await
        .expect("open");

    let mut events = facade.subscribe("pumpA").await.expect("subscribe");

    let slow_id = facade
        .send("pumpA", Operation::Start)
        .await
        .expect("submit slow");
    let next = facade
        .send_wait("pumpA", Operation::Stop)
        .await;
    assert!(next.is_ok(), "queue must keep moving after a timeout");

    // Exactly one result for the timed-out command.
    let mut slow_results = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(DeviceEvent::Result(result))) if result.id == slow_id => {
                assert_eq!(
                    result.result,
                    Err(DeviceError::Timeout(Duration::from_millis(50)))
                );
                slow_results += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert_eq!(slow_results, 1, "exactly one result per timed-out command");

    facade.shutdown().await;
}

#[tokio::test]
async fn timeouts_are_retried_before_failing() {
    let control = ControlSettings {
        poll_interval: Duration::from_secs(60),
        command_timeout: Duration::from_millis(50),
        max_retries: 2,
        ..ControlSettings::default()
    };
    let facade = DeviceFacade::new(control);

    // Two slow attempts, then instant: with two retries the command lands.
    let driver = MockDevice::pump().with_slow_executes(2, Duration::from_millis(300));
    facade
        .connect_driver("pumpA", Box::new(driver))
        .await
        .expect("open");

    tokio_test::assert_ok!(
        facade.send_wait("pumpA", Operation::Start).await,
        "succeeds on the retry"
    );

    facade.shutdown().await;
}

#[tokio::test]
async fn fault_threshold_forces_error_state_until_reconnect() {
    let facade = DeviceFacade::new(tight_control(3));

    let driver = MockDevice::pump().with_failing_executes(3);
    facade
        .connect_driver("pumpA", Box::new(driver))
        .await
        .expect("open");

    // Three consecutive transport failures reach the threshold.
    for _ in 0..3 {
        let err = facade
            .send_wait("pumpA", Operation::Start)
            .await
            .expect_err("injected failure");
        assert!(matches!(err, DeviceError::Connection(_)));
    }

    // Now every command fails fast without touching the device.
    let err = facade
        .send_wait("pumpA", Operation::Start)
        .await
        .expect_err("faulted");
    assert!(matches!(err, DeviceError::Faulted(_, _)));

    // Explicit reconnect clears the fault...
    facade
        .send_wait("pumpA", Operation::Connect)
        .await
        .expect("reconnect");

    // ...and commands flow again.
    facade
        .send_wait("pumpA", Operation::Start)
        .await
        .expect("recovered");

    facade.shutdown().await;
}

#[tokio::test]
async fn protocol_errors_do_not_advance_the_fault_counter() {
    // Threshold of one: a single transport failure would fault the device,
    // so surviving repeated protocol errors proves they are not counted.
    let facade = DeviceFacade::new(tight_control(1));

    let transport = MockTransport::new()
        .with_response("FILT 1", "ok")
        .with_response("FLOW?", "garbage");
    let meter = BfsFlowMeter::new(transport, 1.0);
    facade
        .connect_driver("fm1", Box::new(meter))
        .await
        .expect("open");

    for _ in 0..3 {
        let err = facade
            .send_wait(
                "fm1",
                Operation::Custom {
                    name: "flow".into(),
                    args: serde_json::Value::Null,
                },
            )
            .await
            .expect_err("garbled response");
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    // Still accepting commands: the device never entered the error state.
    facade
        .send_wait(
            "fm1",
            Operation::SetParameter {
                name: "units".into(),
                value: serde_json::json!("mL/min"),
            },
        )
        .await
        .expect("device still healthy");

    facade.shutdown().await;
}
