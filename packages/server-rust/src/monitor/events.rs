//! Monitor event fan-out.

use microbus_core::ServiceRecord;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Registry lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// An instance id was seen for the first time.
    Added(ServiceRecord),
    /// The registry changed; carries the full sorted snapshot.
    Change(Vec<ServiceRecord>),
    /// An instance was dropped after its connection went away.
    Removed(ServiceRecord),
}

/// Delivers every event to every live subscriber, in emission order.
#[derive(Debug)]
pub struct EventHub {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<MonitorEvent>>>,
}

impl EventHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a subscriber. It sees events emitted from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<MonitorEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends `event` to every subscriber; dropped receivers are pruned.
    pub fn emit(&self, event: &MonitorEvent) {
        self.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("monitor subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Drops every subscriber; their receivers end after draining.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
