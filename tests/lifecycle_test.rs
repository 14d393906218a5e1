//! Integration tests for device lifecycle: close-with-drain, cancellation,
//! and cross-device parallelism.

use std::time::Duration;

use labcon::config::ControlSettings;
use labcon::core::{DeviceEvent, Operation};
use labcon::drivers::mock::MockDevice;
use labcon::error::DeviceError;
use labcon::facade::DeviceFacade;

fn slow_device_control() -> ControlSettings {
    ControlSettings {
        poll_interval: Duration::from_secs(60),
        command_timeout: Duration::from_secs(2),
        ..ControlSettings::default()
    }
}

#[tokio::test]
async fn close_drains_in_flight_and_cancels_queued() {
    let facade = DeviceFacade::new(slow_device_control());

    let driver = MockDevice::pump().with_latency(Duration::from_millis(150));
    facade
        .connect_driver("pumpA", Box::new(driver))
        .await
        .expect("open");

    let mut events = facade.subscribe("pumpA").await.expect("subscribe");

    let first = facade.send("pumpA", Operation::Start).await.expect("submit");
    let second = facade.send("pumpA", Operation::Stop).await.expect("submit");
    let third = facade
        .send("pumpA", Operation::Dispense { volume_ul: 1.0 })
        .await
        .expect("submit");

    // Let the worker pick up the first command, then close.
    tokio::time::sleep(Duration::from_millis(50)).await;
    facade.disconnect("pumpA").await.expect("close");

    let mut outcomes = std::collections::HashMap::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Ok(DeviceEvent::Result(result))) => {
                outcomes.insert(result.id, result.result);
            }
            Ok(Ok(DeviceEvent::Status(_))) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    assert!(
        matches!(outcomes.get(&first), Some(Ok(_))),
        "in-flight command must complete, got {:?}",
        outcomes.get(&first)
    );
    assert_eq!(outcomes.get(&second), Some(&Err(DeviceError::Cancelled)));
    assert_eq!(outcomes.get(&third), Some(&Err(DeviceError::Cancelled)));

    // The device is gone from the registry.
    let err = facade
        .send("pumpA", Operation::Stop)
        .await
        .expect_err("closed device");
    assert_eq!(err, DeviceError::UnknownDevice("pumpA".into()));
}

#[tokio::test]
async fn cancelling_a_pending_command_yields_cancelled_result() {
    let facade = DeviceFacade::new(slow_device_control());

    let driver = MockDevice::pump().with_latency(Duration::from_millis(150));
    facade
        .connect_driver("pumpA", Box::new(driver))
        .await
        .expect("open");

    let mut events = facade.subscribe("pumpA").await.expect("subscribe");

    let blocker = facade.send("pumpA", Operation::Start).await.expect("submit");
    let victim = facade.send("pumpA", Operation::Stop).await.expect("submit");

    // The victim is still queued behind the blocker.
    assert!(facade.cancel("pumpA", victim).await.expect("cancel"));

    let mut seen = std::collections::HashMap::new();
    while seen.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(DeviceEvent::Result(result))) => {
                seen.insert(result.id, result.result);
            }
            Ok(Ok(DeviceEvent::Status(_))) => {}
            Ok(Err(err)) => panic!("stream closed early: {err}"),
            Err(_) => panic!("timed out waiting for results"),
        }
    }

    assert!(matches!(seen.get(&blocker), Some(Ok(_))));
    assert_eq!(seen.get(&victim), Some(&Err(DeviceError::Cancelled)));

    facade.shutdown().await;
}

#[tokio::test]
async fn abort_cancels_everything_pending() {
    let facade = DeviceFacade::new(slow_device_control());

    let driver = MockDevice::pump().with_latency(Duration::from_millis(150));
    facade
        .connect_driver("pumpA", Box::new(driver))
        .await
        .expect("open");

    facade.send("pumpA", Operation::Start).await.expect("submit");
    facade.send("pumpA", Operation::Stop).await.expect("submit");
    facade
        .send("pumpA", Operation::Dispense { volume_ul: 1.0 })
        .await
        .expect("submit");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let cancelled = facade.abort("pumpA").await.expect("abort");
    // The first command is in flight; the two behind it are still pending.
    assert_eq!(cancelled, 2);

    facade.shutdown().await;
}

#[tokio::test]
async fn devices_execute_in_parallel() {
    let facade = DeviceFacade::new(slow_device_control());

    let driver_a = MockDevice::pump().with_latency(Duration::from_millis(150));
    let driver_b = MockDevice::pump().with_latency(Duration::from_millis(150));
    let log_a = driver_a.log();
    let log_b = driver_b.log();

    facade
        .connect_driver("pumpA", Box::new(driver_a))
        .await
        .expect("open A");
    facade
        .connect_driver("pumpB", Box::new(driver_b))
        .await
        .expect("open B");

    // Submit to both and wait for both; serialized execution would take
    // ~300ms, parallel ~150ms, but the timestamps are the real check.
    let (a, b) = tokio::join!(
        facade.send_wait("pumpA", Operation::Start),
        facade.send_wait("pumpB", Operation::Start),
    );
    a.expect("A");
    b.expect("B");

    let record_a = log_a.lock().expect("log A")[0].clone();
    let record_b = log_b.lock().expect("log B")[0].clone();

    assert!(
        record_a.started_at < record_b.finished_at && record_b.started_at < record_a.finished_at,
        "execution windows must overlap: A {:?}..{:?}, B {:?}..{:?}",
        record_a.started_at,
        record_a.finished_at,
        record_b.started_at,
        record_b.finished_at
    );

    facade.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_every_device_and_is_idempotent() {
    let facade = DeviceFacade::new(slow_device_control());
    facade
        .connect_driver("pumpA", Box::new(MockDevice::pump()))
        .await
        .expect("open");
    facade
        .connect_driver("fm1", Box::new(MockDevice::flow_meter()))
        .await
        .expect("open");

    let worker_state = facade
        .registry()
        .worker_state("pumpA")
        .await
        .expect("worker state");
    assert_ne!(*worker_state.borrow(), labcon::WorkerState::Stopped);

    let start = std::time::Instant::now();
    facade.shutdown().await;
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "shutdown took too long: {:?}",
        start.elapsed()
    );

    assert!(facade.registry().list().await.is_empty());

    // Second shutdown is a no-op.
    facade.shutdown().await;
}
