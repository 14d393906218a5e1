//! Caller-facing API over the registry, queues and sinks.
//!
//! Everything outside this crate's core — the CLI, the scan engine, GUI
//! panels, scripts — talks to devices through [`DeviceFacade`]. The facade
//! only routes by name and enqueues; it never touches a driver, which is
//! what keeps the one-worker-per-connection ownership rule airtight.
//!
//! Two access modes share one implementation: the async methods here, and
//! [`BlockingFacade`], which drives the same primitives from plain
//! synchronous code by blocking on a runtime handle. There is no second
//! "direct control" code path.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::config::{ControlSettings, DeviceDefinition};
use crate::core::{CommandId, DeviceEvent, Operation, ResponsePayload};
use crate::drivers;
use crate::error::{DeviceError, DeviceResult};
use crate::registry::DeviceRegistry;

/// Thread-safe, non-blocking device control API for any number of callers.
#[derive(Clone)]
pub struct DeviceFacade {
    registry: Arc<DeviceRegistry>,
}

impl DeviceFacade {
    /// Create a facade with a fresh registry.
    pub fn new(control: ControlSettings) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new(control)),
        }
    }

    /// The underlying registry, for callers that need lifecycle details
    /// (worker state observation, device listing).
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Open a device from its configuration entry.
    pub async fn connect(&self, definition: &DeviceDefinition) -> DeviceResult<()> {
        let driver = drivers::build_driver(definition)?;
        self.registry.open(&definition.name, driver).await
    }

    /// Open a device with an explicitly constructed driver (used by tests
    /// and embedders that assemble drivers themselves).
    pub async fn connect_driver(
        &self,
        name: &str,
        driver: Box<dyn crate::core::DeviceDriver>,
    ) -> DeviceResult<()> {
        self.registry.open(name, driver).await
    }

    /// Close a device, draining its worker. Idempotent.
    pub async fn disconnect(&self, name: &str) -> DeviceResult<()> {
        self.registry.close(name).await
    }

    /// Submit a command and return immediately with its id. The outcome
    /// arrives on the device's event stream.
    pub async fn send(&self, name: &str, operation: Operation) -> DeviceResult<CommandId> {
        self.registry.route(name).await?.submit(operation).await
    }

    /// Submit a command and await its result.
    pub async fn send_wait(
        &self,
        name: &str,
        operation: Operation,
    ) -> DeviceResult<ResponsePayload> {
        let queue = self.registry.route(name).await?;
        let (id, reply) = queue.submit_with_reply(operation).await?;
        debug!(device = %name, %id, "awaiting command result");
        match reply.await {
            Ok(result) => result,
            // The worker dropped the reply channel without answering —
            // it died or was closed out from under the caller.
            Err(_) => Err(DeviceError::Connection(format!(
                "device '{name}' dropped the command response channel"
            ))),
        }
    }

    /// Cancel a not-yet-started command. Returns true when the command was
    /// still pending.
    pub async fn cancel(&self, name: &str, id: CommandId) -> DeviceResult<bool> {
        Ok(self.registry.route(name).await?.cancel(id))
    }

    /// Cancel everything still waiting in one device's queue. Returns how
    /// many commands were marked.
    pub async fn abort(&self, name: &str) -> DeviceResult<usize> {
        Ok(self.registry.route(name).await?.cancel_all())
    }

    /// Subscribe to a device's stream of results and status updates.
    ///
    /// The returned receiver also works from synchronous code via
    /// `blocking_recv()`.
    pub async fn subscribe(
        &self,
        name: &str,
    ) -> DeviceResult<broadcast::Receiver<DeviceEvent>> {
        self.registry.subscribe(name).await
    }

    /// Close every open device, draining each worker.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

/// Synchronous wrapper for scripted/command-line use.
///
/// Blocks on the same async primitives the rest of the system uses, via a
/// [`tokio::runtime::Handle`]. Must be called from a thread that is *not*
/// running the runtime (a script thread, a REPL) — blocking inside a
/// runtime worker would deadlock it, and tokio panics on the attempt.
pub struct BlockingFacade {
    handle: tokio::runtime::Handle,
    facade: DeviceFacade,
}

impl BlockingFacade {
    /// Wrap an async facade with a handle to the runtime driving it.
    pub fn new(handle: tokio::runtime::Handle, facade: DeviceFacade) -> Self {
        Self { handle, facade }
    }

    /// See [`DeviceFacade::connect`].
    pub fn connect(&self, definition: &DeviceDefinition) -> DeviceResult<()> {
        self.handle.block_on(self.facade.connect(definition))
    }

    /// See [`DeviceFacade::disconnect`].
    pub fn disconnect(&self, name: &str) -> DeviceResult<()> {
        self.handle.block_on(self.facade.disconnect(name))
    }

    /// See [`DeviceFacade::send`].
    pub fn send(&self, name: &str, operation: Operation) -> DeviceResult<CommandId> {
        self.handle.block_on(self.facade.send(name, operation))
    }

    /// See [`DeviceFacade::send_wait`].
    pub fn send_wait(&self, name: &str, operation: Operation) -> DeviceResult<ResponsePayload> {
        self.handle.block_on(self.facade.send_wait(name, operation))
    }

    /// See [`DeviceFacade::subscribe`]. Use `blocking_recv()` on the
    /// returned receiver.
    pub fn subscribe(&self, name: &str) -> DeviceResult<broadcast::Receiver<DeviceEvent>> {
        self.handle.block_on(self.facade.subscribe(name))
    }

    /// See [`DeviceFacade::shutdown`].
    pub fn shutdown(&self) {
        self.handle.block_on(self.facade.shutdown());
    }
}
