//! Device registry: lifecycle and name-routing authority for open devices.
//!
//! The registry owns every open device's handle — queue sender, event sink,
//! worker task — keyed by the unique device name. Callers never hold a
//! handle themselves; they address devices by name through the facade,
//! which routes through here.
//!
//! Lifecycle: `open` connects the driver first (so a connection failure
//! surfaces before any handle exists), then spawns the control worker.
//! `close` signals the worker, waits for the drain with a bounded timeout,
//! and aborts as a last resort; closing a device that is not open is a
//! no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ControlSettings;
use crate::core::{DeviceDriver, DeviceEvent, WorkerState};
use crate::error::{DeviceError, DeviceResult};
use crate::queue::CommandQueue;
use crate::sink::EventSink;
use crate::worker::{self, WorkerConfig, WorkerHandle};

/// Runtime handle for one open device. Private to the registry.
struct DeviceHandle {
    queue: CommandQueue,
    sink: EventSink,
    worker: Option<WorkerHandle>,
}

/// Tracks all currently-open devices and manages connection lifecycle.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceHandle>>,
    /// Names mid-`open`, reserved so a concurrent open of the same name is
    /// rejected without holding the device map across the connect.
    opening: StdMutex<HashSet<String>>,
    control: ControlSettings,
}

impl DeviceRegistry {
    /// Create an empty registry with the given worker/queue tuning.
    pub fn new(control: ControlSettings) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            opening: StdMutex::new(HashSet::new()),
            control,
        }
    }

    /// Open a device: connect its driver, then spawn its control worker.
    ///
    /// Fails with [`DeviceError::DuplicateDevice`] when the name is already
    /// open (or being opened), and with the driver's connection error when
    /// the transport cannot be established — in which case nothing is
    /// registered.
    pub async fn open(
        &self,
        name: &str,
        mut driver: Box<dyn DeviceDriver>,
    ) -> DeviceResult<()> {
        self.reserve(name).await?;

        info!(device = %name, kind = ?driver.kind(), "opening device");
        let connected =
            tokio::time::timeout(self.control.command_timeout, driver.connect()).await;

        let connect_result = match connected {
            Ok(result) => result,
            Err(_elapsed) => Err(DeviceError::Connection(format!(
                "connect timed out after {:?}",
                self.control.command_timeout
            ))),
        };

        if let Err(err) = connect_result {
            warn!(device = %name, error = %err, "device open failed");
            self.release(name);
            return Err(err);
        }

        let (queue, rx, queue_state) = CommandQueue::new(
            name,
            self.control.queue_capacity,
            self.control.submit_policy,
        );
        let sink = EventSink::new(self.control.event_buffer);
        let worker = worker::spawn(
            name.to_string(),
            driver,
            rx,
            queue_state,
            sink.clone(),
            WorkerConfig {
                poll_interval: self.control.poll_interval,
                command_timeout: self.control.command_timeout,
                max_retries: self.control.max_retries,
                fault_threshold: self.control.fault_threshold,
            },
        );

        let handle = DeviceHandle {
            queue,
            sink,
            worker: Some(worker),
        };
        self.devices.lock().await.insert(name.to_string(), handle);
        self.release(name);

        info!(device = %name, "device open");
        Ok(())
    }

    /// Close a device: signal its worker, await the drain, release the
    /// connection. Idempotent — closing a device that is not open is a
    /// no-op.
    pub async fn close(&self, name: &str) -> DeviceResult<()> {
        let handle = self.devices.lock().await.remove(name);
        let Some(mut handle) = handle else {
            debug!(device = %name, "close of device that is not open; ignoring");
            return Ok(());
        };

        if let Some(worker) = handle.worker.take() {
            let _ = worker.shutdown_tx.send(());

            match tokio::time::timeout(self.control.shutdown_timeout, worker.task).await {
                Ok(Ok(Ok(()))) => {
                    info!(device = %name, "device closed");
                }
                Ok(Ok(Err(err))) => {
                    error!(device = %name, error = %err, "worker finished with error during close");
                }
                Ok(Err(join_err)) => {
                    error!(device = %name, error = %join_err, "worker task panicked");
                }
                Err(_elapsed) => {
                    warn!(
                        device = %name,
                        timeout = ?self.control.shutdown_timeout,
                        "worker did not drain in time; aborting"
                    );
                    // The JoinHandle was consumed by the timeout future;
                    // dropping it detaches, and the worker will exit on its
                    // closed queue. Nothing further to await here.
                }
            }
        }

        Ok(())
    }

    /// Route a device name to its command queue.
    pub async fn route(&self, name: &str) -> DeviceResult<CommandQueue> {
        let devices = self.devices.lock().await;
        devices
            .get(name)
            .map(|handle| handle.queue.clone())
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))
    }

    /// Subscribe to a device's event stream.
    pub async fn subscribe(
        &self,
        name: &str,
    ) -> DeviceResult<broadcast::Receiver<DeviceEvent>> {
        let devices = self.devices.lock().await;
        devices
            .get(name)
            .map(|handle| handle.sink.subscribe())
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))
    }

    /// Observe a device's worker state (Idle/Executing/Polling/...).
    pub async fn worker_state(&self, name: &str) -> DeviceResult<watch::Receiver<WorkerState>> {
        let devices = self.devices.lock().await;
        devices
            .get(name)
            .and_then(|handle| handle.worker.as_ref())
            .map(|worker| worker.worker_state.clone())
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))
    }

    /// Names of all open devices.
    pub async fn list(&self) -> Vec<String> {
        self.devices.lock().await.keys().cloned().collect()
    }

    /// Close every open device, draining each worker. Called on process
    /// exit so no connection is abandoned mid-command.
    pub async fn shutdown_all(&self) {
        let names = self.list().await;
        for name in names {
            if let Err(err) = self.close(&name).await {
                error!(device = %name, error = %err, "close failed during shutdown");
            }
        }
    }

    async fn reserve(&self, name: &str) -> DeviceResult<()> {
        if self.devices.lock().await.contains_key(name) {
            return Err(DeviceError::DuplicateDevice(name.to_string()));
        }
        let mut opening = lock_opening(&self.opening);
        if !opening.insert(name.to_string()) {
            return Err(DeviceError::DuplicateDevice(name.to_string()));
        }
        Ok(())
    }

    fn release(&self, name: &str) {
        lock_opening(&self.opening).remove(name);
    }
}

fn lock_opening(opening: &StdMutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    match opening.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSettings;
    use crate::drivers::mock::MockDevice;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(ControlSettings::default())
    }

    #[tokio::test]
    async fn open_registers_and_duplicate_is_rejected() {
        let registry = registry();
        registry
            .open("pumpA", Box::new(MockDevice::pump()))
            .await
            .expect("open");

        assert_eq!(registry.list().await, vec!["pumpA".to_string()]);

        let err = registry
            .open("pumpA", Box::new(MockDevice::pump()))
            .await
            .expect_err("duplicate");
        assert_eq!(err, DeviceError::DuplicateDevice("pumpA".into()));

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = registry();
        registry
            .open("fm1", Box::new(MockDevice::flow_meter()))
            .await
            .expect("open");

        registry.close("fm1").await.expect("close");
        registry.close("fm1").await.expect("second close is a no-op");
        registry.close("never-opened").await.expect("unknown close ok");
    }

    #[tokio::test]
    async fn route_unknown_device_fails() {
        let registry = registry();
        let err = registry.route("ghost").await.expect_err("unknown");
        assert_eq!(err, DeviceError::UnknownDevice("ghost".into()));
    }

    #[tokio::test]
    async fn failed_connect_leaves_nothing_registered() {
        let registry = registry();
        let err = registry
            .open("broken", Box::new(MockDevice::failing_connect()))
            .await
            .expect_err("connect fails");
        assert!(matches!(err, DeviceError::Connection(_)));
        assert!(registry.list().await.is_empty());

        // The name is free again after the failure.
        registry
            .open("broken", Box::new(MockDevice::pump()))
            .await
            .expect("retry with working driver");
        registry.shutdown_all().await;
    }
}
