//! Client-side service registry.
//!
//! A [`Monitor`] keeps a [`ServiceRecord`] per live instance, fed by three
//! sources: `$SRV.REG` announcements (always on), discovery windows
//! (on demand or periodic), and, with a system connection, disconnect
//! advisories that remove instances whose connection went away.

pub mod config;
pub mod discovery;
pub mod events;
pub mod registry;
pub mod schedule;

use std::sync::Arc;
use std::time::Duration;

use microbus_core::subject::{DISCONNECT_WILDCARD, REGISTRATION_SUBJECT};
use microbus_core::{ServiceRecord, SubscriptionId, Transport, TransportError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use config::MonitorConfig;
pub use discovery::{DiscoverOptions, DiscoveryHandle};
pub use events::{EventHub, MonitorEvent};
pub use registry::RecordStore;

use discovery::{listen_announcements, listen_disconnects, Discoverer, Shared};
use schedule::{PeriodicDiscovery, Schedule};

/// A subscription owned by the monitor and the task reading it.
struct Listener {
    transport: Arc<dyn Transport>,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

/// Tracks running service instances.
///
/// The announcement listener starts at construction. Clones share the same
/// registry, listeners, and periodic schedule.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: MonitorConfig,
    discoverer: Discoverer,
    listeners: Mutex<Vec<Listener>>,
    periodic: Mutex<Option<Schedule>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        // Subscriptions die with their connection; the tasks must not outlive us.
        self.discoverer.shutdown.cancel();
        for listener in self.listeners.get_mut().drain(..) {
            listener.task.abort();
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("records", &self.inner.discoverer.shared.records.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates a monitor with the default [`MonitorConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the announcement subscription fails.
    pub async fn new(transport: Arc<dyn Transport>) -> Result<Self, TransportError> {
        Self::with_config(transport, MonitorConfig::default()).await
    }

    /// # Errors
    ///
    /// Returns an error if the announcement subscription fails.
    pub async fn with_config(
        transport: Arc<dyn Transport>,
        config: MonitorConfig,
    ) -> Result<Self, TransportError> {
        let shared = Arc::new(Shared {
            records: RecordStore::new(),
            events: EventHub::new(config.event_buffer),
        });
        let subscription = transport.subscribe(REGISTRATION_SUBJECT, None).await?;
        let listener = Listener {
            transport: transport.clone(),
            subscription: subscription.id,
            task: tokio::spawn(listen_announcements(subscription, shared.clone())),
        };

        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                discoverer: Discoverer {
                    transport,
                    shared,
                    shutdown: CancellationToken::new(),
                },
                listeners: Mutex::new(vec![listener]),
                periodic: Mutex::new(None),
            }),
        })
    }

    /// Enables disconnect correlation through a system-privileged connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `$SYS.ACCOUNT.*.DISCONNECT` cannot be subscribed,
    /// typically `PermissionDenied` for a non-system connection.
    pub async fn with_system_transport(
        self,
        system: Arc<dyn Transport>,
    ) -> Result<Self, TransportError> {
        let subscription = system.subscribe(DISCONNECT_WILDCARD, None).await?;
        let listener = Listener {
            transport: system,
            subscription: subscription.id,
            task: tokio::spawn(listen_disconnects(
                subscription,
                self.inner.discoverer.shared.clone(),
            )),
        };
        self.inner.listeners.lock().await.push(listener);
        debug!("disconnect correlation enabled");
        Ok(self)
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Opens a discovery window of length `timeout`.
    ///
    /// Unless `options.do_not_clear` is set the registry is cleared before
    /// this returns. Overlapping windows run independently and merge into
    /// the same registry.
    pub fn discover(&self, timeout: Duration, options: DiscoverOptions) -> DiscoveryHandle {
        self.inner.discoverer.discover(timeout, options)
    }

    /// Plain discovery with the configured default window.
    pub fn refresh(&self) -> DiscoveryHandle {
        self.discover(self.default_window(), DiscoverOptions::default())
    }

    /// Runs a plain discovery every `interval`, starting now. Replaces any
    /// running schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if `interval` is zero or the first round cannot be
    /// scheduled. A rejected call leaves any running schedule untouched.
    pub async fn start_periodic_discovery(
        &self,
        interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        if interval.is_zero() {
            anyhow::bail!("periodic discovery interval must be non-zero");
        }
        let mut periodic = self.inner.periodic.lock().await;
        if let Some(mut previous) = periodic.take() {
            previous.stop().await;
        }
        let job = PeriodicDiscovery::new(self.inner.discoverer.clone(), timeout);
        let schedule = Schedule::spawn(job, interval);
        schedule.trigger()?;
        *periodic = Some(schedule);
        info!(?interval, ?timeout, "periodic discovery started");
        Ok(())
    }

    /// Stops the schedule. Windows already open run to completion.
    pub async fn stop_periodic_discovery(&self) {
        if let Some(mut schedule) = self.inner.periodic.lock().await.take() {
            schedule.stop().await;
        }
    }

    pub async fn is_periodic_discovery_running(&self) -> bool {
        self.inner
            .periodic
            .lock()
            .await
            .as_ref()
            .is_some_and(Schedule::is_running)
    }

    /// All known records, sorted by service name then instance id.
    #[must_use]
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.inner.discoverer.shared.records.snapshot()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceRecord> {
        self.inner.discoverer.shared.records.get(id)
    }

    /// Forgets every record without emitting events.
    pub fn clear(&self) {
        self.inner.discoverer.shared.records.clear();
    }

    /// Event stream starting now.
    pub fn subscribe(&self) -> mpsc::Receiver<MonitorEvent> {
        self.inner.discoverer.shared.events.subscribe()
    }

    /// Stops everything: periodic schedule, open windows (they resolve
    /// without a `Change`), and listeners. Event streams end.
    pub async fn close(&self) {
        self.stop_periodic_discovery().await;
        self.inner.discoverer.shutdown.cancel();

        let listeners = std::mem::take(&mut *self.inner.listeners.lock().await);
        for listener in listeners {
            let _ = listener.transport.unsubscribe(listener.subscription).await;
            listener.task.abort();
        }
        self.inner.discoverer.shared.events.close();
        debug!("monitor closed");
    }

    fn default_window(&self) -> Duration {
        Duration::from_millis(self.inner.config.default_discover_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use microbus_core::{
        ConnectionInfo, InfoResponse, Message, ServiceIdentity, REGISTRATION_SUBJECT,
    };

    use super::*;
    use crate::transport::MemoryBroker;

    fn info(name: &str, id: &str, client_id: u64) -> Bytes {
        let info = InfoResponse::new(
            ServiceIdentity {
                name: name.to_string(),
                id: id.to_string(),
                version: "1.0.0".to_string(),
                metadata: std::collections::HashMap::new(),
            },
            String::new(),
            Vec::new(),
            Some(ConnectionInfo {
                client_id,
                ip: None,
                account: Some("APP".to_string()),
                user: None,
            }),
        );
        Bytes::from(serde_json::to_vec(&info).unwrap())
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();

        let result = monitor
            .start_periodic_discovery(Duration::ZERO, Duration::from_millis(50))
            .await;

        assert!(result.is_err());
        assert!(!monitor.is_periodic_discovery_running().await);
    }

    #[tokio::test]
    async fn announcement_adds_then_updates() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();
        let mut events = monitor.subscribe();
        let publisher = broker.connect();

        publisher
            .publish(Message::new(REGISTRATION_SUBJECT, info("echo", "a", 1)))
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(MonitorEvent::Added(r)) if r.id == "a"));
        assert!(matches!(events.recv().await, Some(MonitorEvent::Change(s)) if s.len() == 1));

        publisher
            .publish(Message::new(REGISTRATION_SUBJECT, info("echo", "a", 1)))
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(MonitorEvent::Change(s)) if s.len() == 1));
        assert_eq!(monitor.records().len(), 1);
    }

    #[tokio::test]
    async fn malformed_announcement_is_ignored() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();
        broker
            .connect()
            .publish(Message::new(REGISTRATION_SUBJECT, "not json"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.records().is_empty());
    }

    #[tokio::test]
    async fn empty_discovery_emits_one_change() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();
        let mut events = monitor.subscribe();

        let handle = monitor.discover(Duration::from_millis(50), DiscoverOptions::default());
        let snapshot = handle.await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(events.recv().await, Some(MonitorEvent::Change(Vec::new())));
    }

    #[tokio::test]
    async fn cancelled_discovery_emits_no_change() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();
        let mut events = monitor.subscribe();

        let handle = monitor.discover(Duration::from_secs(30), DiscoverOptions::default());
        handle.cancel();
        let snapshot = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_system_connection_cannot_correlate() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();
        let err = monitor.with_system_transport(broker.connect()).await.unwrap_err();
        assert!(matches!(err, TransportError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn close_ends_event_stream() {
        let broker = MemoryBroker::new();
        let monitor = Monitor::new(broker.connect()).await.unwrap();
        let mut events = monitor.subscribe();
        monitor.close().await;
        assert_eq!(events.recv().await, None);
        assert_eq!(broker.subscription_count(), 0);
    }
}
