//! Per-device command queue.
//!
//! One bounded mpsc channel per open device, drained exclusively by that
//! device's control worker. FIFO order within a device is guaranteed by the
//! channel; nothing orders commands across devices. Callers hold a cloned
//! [`CommandQueue`] handle obtained from the registry and never touch the
//! worker or driver directly.
//!
//! A command that should report back to the submitting caller carries a
//! oneshot reply sender alongside it; the worker fulfills it exactly once.
//! Cancellation marks a still-pending command id; the worker skips marked
//! commands at dequeue and emits a `Cancelled` result instead of executing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::config::SubmitPolicy;
use crate::core::{Command, CommandId, Operation, ResponsePayload};
use crate::error::{DeviceError, DeviceResult};

/// Reply channel fulfilled by the worker when the command finishes.
pub type ReplyReceiver = oneshot::Receiver<DeviceResult<ResponsePayload>>;
pub(crate) type ReplySender = oneshot::Sender<DeviceResult<ResponsePayload>>;

/// A command plus its optional reply channel, as carried by the channel.
pub(crate) struct QueuedCommand {
    pub command: Command,
    pub reply: Option<ReplySender>,
}

/// Book-keeping shared between the queue handle and the worker: which ids
/// are still waiting in the channel, and which of those were cancelled.
#[derive(Default, Debug)]
pub(crate) struct QueueState {
    pending: HashSet<CommandId>,
    cancelled: HashSet<CommandId>,
}

impl QueueState {
    /// Called by the worker for every dequeued command. Returns true when
    /// the command was cancelled while pending and must be skipped.
    pub(crate) fn take_dequeued(&mut self, id: &CommandId) -> bool {
        self.pending.remove(id);
        self.cancelled.remove(id)
    }
}

/// Caller-side handle for submitting commands to one device.
#[derive(Clone, Debug)]
pub struct CommandQueue {
    device: String,
    tx: mpsc::Sender<QueuedCommand>,
    state: Arc<Mutex<QueueState>>,
    policy: SubmitPolicy,
}

impl CommandQueue {
    /// Create the queue and its worker-side receiver.
    pub(crate) fn new(
        device: impl Into<String>,
        capacity: usize,
        policy: SubmitPolicy,
    ) -> (Self, mpsc::Receiver<QueuedCommand>, Arc<Mutex<QueueState>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::new(Mutex::new(QueueState::default()));
        (
            Self {
                device: device.into(),
                tx,
                state: state.clone(),
                policy,
            },
            rx,
            state,
        )
    }

    /// Device this queue belongs to.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Submit a fire-and-forget command. The outcome still reaches the
    /// device's event stream; nothing awaits it.
    pub async fn submit(&self, operation: Operation) -> DeviceResult<CommandId> {
        let command = Command::new(&self.device, operation);
        let id = command.id;
        self.enqueue(QueuedCommand {
            command,
            reply: None,
        })
        .await?;
        Ok(id)
    }

    /// Submit a command whose result the caller will await.
    pub async fn submit_with_reply(
        &self,
        operation: Operation,
    ) -> DeviceResult<(CommandId, ReplyReceiver)> {
        let mut command = Command::new(&self.device, operation);
        command.requires_response = true;
        let id = command.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(QueuedCommand {
            command,
            reply: Some(reply_tx),
        })
        .await?;
        Ok((id, reply_rx))
    }

    /// Cancel a not-yet-started command. Returns true when the command was
    /// still pending; an in-flight or finished command is unaffected.
    pub fn cancel(&self, id: CommandId) -> bool {
        let mut state = lock_state(&self.state);
        if state.pending.contains(&id) {
            state.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Cancel every command still waiting in the queue. Returns how many
    /// were marked.
    pub fn cancel_all(&self) -> usize {
        let mut state = lock_state(&self.state);
        let ids: Vec<CommandId> = state.pending.iter().copied().collect();
        for id in &ids {
            state.cancelled.insert(*id);
        }
        ids.len()
    }

    /// Commands currently waiting in the queue (excluding the one the
    /// worker may be executing).
    pub fn pending(&self) -> usize {
        lock_state(&self.state).pending.len()
    }

    async fn enqueue(&self, queued: QueuedCommand) -> DeviceResult<()> {
        let id = queued.command.id;
        lock_state(&self.state).pending.insert(id);

        let outcome = match self.policy {
            SubmitPolicy::Block => self
                .tx
                .send(queued)
                .await
                .map_err(|_| DeviceError::UnknownDevice(self.device.clone())),
            SubmitPolicy::Fail => self.tx.try_send(queued).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DeviceError::QueueFull(self.device.clone()),
                mpsc::error::TrySendError::Closed(_) => {
                    DeviceError::UnknownDevice(self.device.clone())
                }
            }),
        };

        if outcome.is_err() {
            lock_state(&self.state).pending.remove(&id);
        }
        outcome
    }
}

/// The mutex only guards two small hash sets; a poisoned lock means a
/// panicked thread mid-insert, and continuing with the inner state is safe.
pub(crate) fn lock_state(state: &Mutex<QueueState>) -> std::sync::MutexGuard<'_, QueueState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) use lock_state as lock_queue_state;
