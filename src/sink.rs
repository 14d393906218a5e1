//! Per-device event sink.
//!
//! Each open device owns one [`EventSink`]: a broadcast channel of
//! [`DeviceEvent`] that any number of observers (panels, scripts, the scan
//! engine) can subscribe to independently. Broadcast semantics mean a slow
//! subscriber lags — losing its *oldest* buffered events and learning how
//! many via `RecvError::Lagged` — without ever blocking the worker or other
//! subscribers.
//!
//! Command results awaited by a specific caller do not rely on this channel:
//! they ride a dedicated oneshot carried with the queued command, so they
//! cannot be lost to lag. The sink's copy of each result exists for passive
//! observers.

use tokio::sync::broadcast;

use crate::core::{CommandResult, DeviceEvent, StatusUpdate};

/// Publishing side of one device's event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventSink {
    /// Create a sink whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the stream. Events published before this call are not
    /// delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Publish a command outcome. A send error only means there are no
    /// subscribers right now, which is fine.
    pub fn publish_result(&self, result: CommandResult) {
        let _ = self.tx.send(DeviceEvent::Result(result));
    }

    /// Publish a telemetry snapshot.
    pub fn publish_status(&self, status: StatusUpdate) {
        let _ = self.tx.send(DeviceEvent::Status(status));
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceState, Telemetry};
    use chrono::Utc;

    fn status(device: &str, position: f64) -> StatusUpdate {
        StatusUpdate {
            device: device.into(),
            timestamp: Utc::now(),
            state: DeviceState::Connected,
            telemetry: Telemetry::Motor {
                position,
                moving: false,
            },
        }
    }

    #[tokio::test]
    async fn all_subscribers_see_events() {
        let sink = EventSink::new(8);
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();

        sink.publish_status(status("mx", 1.0));

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await {
                Ok(DeviceEvent::Status(s)) => assert_eq!(s.device, "mx"),
                other => panic!("expected status event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_loses_oldest() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();

        for i in 0..5 {
            sink.publish_status(status("mx", f64::from(i)));
        }

        // The two newest survive; the receiver reports how many were skipped.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        match rx.recv().await {
            Ok(DeviceEvent::Status(s)) => match s.telemetry {
                Telemetry::Motor { position, .. } => assert_eq!(position, 3.0),
                other => panic!("unexpected telemetry {other:?}"),
            },
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_harmless() {
        let sink = EventSink::new(4);
        sink.publish_status(status("mx", 0.0));
        assert_eq!(sink.subscriber_count(), 0);
    }
}
