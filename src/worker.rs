//! Control worker: the single owner of one device's connection.
//!
//! One worker task is spawned per open device. It is the only code that
//! ever touches the device's driver, which makes the driver lock-free by
//! construction. Per loop iteration the worker either executes the next
//! queued command (bounded by the configured timeout, retried on timeout),
//! or — when idle past the poll interval — reads a telemetry snapshot and
//! publishes it. A shutdown signal is honored ahead of any pending poll but
//! only after the in-flight command has completed or timed out, so hardware
//! is never left mid-command.
//!
//! Failure policy: a timed-out or transport-failed operation increments a
//! consecutive-failure counter; at the configured threshold the device
//! enters [`DeviceState::Error`] and rejects everything except an explicit
//! `Connect` until that reconnect succeeds. Protocol errors fail the single
//! command without advancing the counter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::{
    CommandResult, DeviceDriver, DeviceState, Operation, ResponsePayload, StatusUpdate, Telemetry,
    WorkerState,
};
use crate::error::{DeviceError, DeviceResult};
use crate::queue::{lock_queue_state, QueueState, QueuedCommand};
use crate::sink::EventSink;

/// Worker tuning, extracted from [`crate::config::ControlSettings`].
#[derive(Clone, Debug)]
pub(crate) struct WorkerConfig {
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub fault_threshold: u32,
}

/// Handle pieces returned by [`spawn`].
pub(crate) struct WorkerHandle {
    pub task: JoinHandle<Result<()>>,
    pub shutdown_tx: oneshot::Sender<()>,
    pub worker_state: watch::Receiver<WorkerState>,
}

/// Spawn the control worker task for an already-connected driver.
pub(crate) fn spawn(
    device: String,
    driver: Box<dyn DeviceDriver>,
    rx: mpsc::Receiver<QueuedCommand>,
    queue_state: Arc<Mutex<QueueState>>,
    sink: EventSink,
    config: WorkerConfig,
) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (state_tx, state_rx) = watch::channel(WorkerState::Idle);

    let worker = ControlWorker {
        device,
        driver,
        rx,
        queue_state,
        sink,
        config,
        device_state: DeviceState::Connected,
        consecutive_failures: 0,
        worker_state: state_tx,
    };

    let task = tokio::spawn(worker.run(shutdown_rx));

    WorkerHandle {
        task,
        shutdown_tx,
        worker_state: state_rx,
    }
}

struct ControlWorker {
    device: String,
    driver: Box<dyn DeviceDriver>,
    rx: mpsc::Receiver<QueuedCommand>,
    queue_state: Arc<Mutex<QueueState>>,
    sink: EventSink,
    config: WorkerConfig,
    device_state: DeviceState,
    consecutive_failures: u32,
    worker_state: watch::Sender<WorkerState>,
}

impl ControlWorker {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        info!(device = %self.device, "control worker started");

        let mut poll = tokio::time::interval(self.config.poll_interval);
        // Missed ticks coalesce: after a long command at most one poll runs.
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.reset();

        loop {
            tokio::select! {
                biased;
                // Stop requests win over pending work; the branches below
                // are only entered between commands, so the in-flight one
                // always finishes first.
                _ = &mut shutdown_rx => {
                    debug!(device = %self.device, "shutdown signal received");
                    break;
                }
                maybe = self.rx.recv() => match maybe {
                    Some(queued) => {
                        self.handle_command(queued).await;
                        poll.reset();
                    }
                    // Registry dropped every queue handle: nothing can be
                    // submitted anymore, stop as if signalled.
                    None => break,
                },
                _ = poll.tick() => {
                    self.poll_status().await;
                }
            }
        }

        self.set_worker_state(WorkerState::Stopping);
        self.drain_with_cancellation();

        if let Err(err) = self.driver.disconnect().await {
            warn!(device = %self.device, error = %err, "driver disconnect failed during shutdown");
        }

        self.set_worker_state(WorkerState::Stopped);
        info!(device = %self.device, "control worker stopped");
        Ok(())
    }

    /// Execute one dequeued command end-to-end: cancellation check,
    /// fault-state gate, timed execution, state bookkeeping, result
    /// delivery.
    async fn handle_command(&mut self, queued: QueuedCommand) {
        let QueuedCommand { command, reply } = queued;

        let was_cancelled =
            lock_queue_state(&self.queue_state).take_dequeued(&command.id);
        if was_cancelled {
            debug!(device = %self.device, id = %command.id, "skipping cancelled command");
            self.finish(command.id, Err(DeviceError::Cancelled), reply);
            return;
        }

        if self.device_state == DeviceState::Error
            && !matches!(command.operation, Operation::Connect)
        {
            let err = DeviceError::Faulted(self.device.clone(), self.consecutive_failures);
            self.finish(command.id, Err(err), reply);
            return;
        }

        self.set_worker_state(WorkerState::Executing);
        debug!(
            device = %self.device,
            id = %command.id,
            operation = command.operation.label(),
            "executing command"
        );

        let result = self.execute_with_retry(&command.operation).await;
        self.apply_outcome(&command.operation, &result);
        self.finish(command.id, result, reply);
        self.set_worker_state(WorkerState::Idle);
    }

    /// Run one operation against the driver, bounded by the command
    /// timeout. Timeouts are retried up to `max_retries`; driver errors are
    /// not (the device answered — retrying a protocol error re-sends a
    /// command the instrument already rejected).
    async fn execute_with_retry(
        &mut self,
        operation: &Operation,
    ) -> DeviceResult<ResponsePayload> {
        let timeout = self.config.command_timeout;
        let mut attempt: u32 = 0;

        loop {
            let outcome = match operation {
                Operation::Connect => {
                    self.device_state = DeviceState::Connecting;
                    tokio::time::timeout(timeout, self.driver.connect())
                        .await
                        .map(|r| r.map(|()| ResponsePayload::None))
                }
                Operation::Disconnect => tokio::time::timeout(timeout, self.driver.disconnect())
                    .await
                    .map(|r| r.map(|()| ResponsePayload::None)),
                Operation::QueryStatus => {
                    tokio::time::timeout(timeout, self.driver.read_status())
                        .await
                        .map(|r| r.map(ResponsePayload::Status))
                }
                other => tokio::time::timeout(timeout, self.driver.execute(other)).await,
            };

            match outcome {
                Ok(result) => return result,
                Err(_elapsed) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(DeviceError::Timeout(timeout));
                    }
                    warn!(
                        device = %self.device,
                        operation = operation.label(),
                        attempt,
                        "operation timed out, retrying"
                    );
                }
            }
        }
    }

    /// Update device state and the fault counter from a command outcome.
    fn apply_outcome(
        &mut self,
        operation: &Operation,
        result: &DeviceResult<ResponsePayload>,
    ) {
        match result {
            Ok(_) => {
                self.consecutive_failures = 0;
                match operation {
                    Operation::Connect => {
                        self.device_state = DeviceState::Connected;
                        info!(device = %self.device, "device (re)connected");
                    }
                    Operation::Disconnect => self.device_state = DeviceState::Disconnected,
                    _ => {}
                }
            }
            Err(err) => {
                if matches!(operation, Operation::Connect) {
                    // The transport is in an unknown half-open state after a
                    // failed connect; only another Connect can clear this.
                    self.device_state = DeviceState::Error;
                }
                if err.is_transport_failure() {
                    self.register_transport_failure(err);
                }
            }
        }
    }

    /// Idle status poll. Skipped unless the device is connected.
    async fn poll_status(&mut self) {
        if self.device_state != DeviceState::Connected {
            return;
        }

        self.set_worker_state(WorkerState::Polling);

        let outcome =
            tokio::time::timeout(self.config.command_timeout, self.driver.read_status()).await;

        match outcome {
            Ok(Ok(telemetry)) => {
                self.consecutive_failures = 0;
                self.sink.publish_status(StatusUpdate {
                    device: self.device.clone(),
                    timestamp: Utc::now(),
                    state: self.device_state,
                    telemetry,
                });
            }
            Ok(Err(err)) => {
                warn!(device = %self.device, error = %err, "status poll failed");
                if err.is_transport_failure() {
                    self.register_transport_failure(&err);
                }
                self.publish_fault_status(&err);
            }
            Err(_elapsed) => {
                let err = DeviceError::Timeout(self.config.command_timeout);
                warn!(device = %self.device, "status poll timed out");
                self.register_transport_failure(&err);
                self.publish_fault_status(&err);
            }
        }

        self.set_worker_state(WorkerState::Idle);
    }

    fn register_transport_failure(&mut self, err: &DeviceError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.fault_threshold
            && self.device_state != DeviceState::Error
        {
            error!(
                device = %self.device,
                failures = self.consecutive_failures,
                error = %err,
                "fault threshold reached; device enters error state until reconnect"
            );
            self.device_state = DeviceState::Error;
        }
    }

    /// Report a failed poll on the event stream so observers see the device
    /// degrading, not just a gap in telemetry.
    fn publish_fault_status(&self, err: &DeviceError) {
        self.sink.publish_status(StatusUpdate {
            device: self.device.clone(),
            timestamp: Utc::now(),
            state: self.device_state,
            telemetry: Telemetry::Generic(serde_json::json!({ "error": err.to_string() })),
        });
    }

    /// After the loop exits: everything still in the channel was never
    /// started, so each gets exactly one `Cancelled` result.
    fn drain_with_cancellation(&mut self) {
        self.rx.close();
        while let Ok(queued) = self.rx.try_recv() {
            lock_queue_state(&self.queue_state).take_dequeued(&queued.command.id);
            debug!(device = %self.device, id = %queued.command.id, "cancelling queued command on close");
            self.finish(queued.command.id, Err(DeviceError::Cancelled), queued.reply);
        }
    }

    /// Deliver the outcome to the awaiting caller (if any) and publish it
    /// on the event stream. Exactly one result per command.
    fn finish(
        &self,
        id: crate::core::CommandId,
        result: DeviceResult<ResponsePayload>,
        reply: Option<crate::queue::ReplySender>,
    ) {
        if let Some(reply) = reply {
            // A dropped receiver just means the caller stopped waiting.
            let _ = reply.send(result.clone());
        }
        self.sink.publish_result(CommandResult {
            id,
            device: self.device.clone(),
            result,
            finished_at: Utc::now(),
        });
    }

    fn set_worker_state(&self, state: WorkerState) {
        self.worker_state.send_replace(state);
    }
}
