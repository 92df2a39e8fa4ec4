//! Discovery windows and the long-lived monitor listeners.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use microbus_core::{
    now_millis, DisconnectAdvisory, DiscoveryVerb, InfoResponse, Message, ServiceRecord,
    Subscription, Transport, TransportError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::events::{EventHub, MonitorEvent};
use super::registry::RecordStore;

/// State shared by the monitor, its listeners, and every discovery window.
#[derive(Debug)]
pub(crate) struct Shared {
    pub records: RecordStore,
    pub events: EventHub,
}

impl Shared {
    /// Merges one sighting; emits `Added` for unknown ids.
    fn observe(&self, info: InfoResponse) {
        let record = ServiceRecord::from_info(info, now_millis());
        if self.records.upsert(record.clone()) {
            self.events.emit(&MonitorEvent::Added(record));
        }
    }

    fn emit_change(&self) -> Vec<ServiceRecord> {
        let snapshot = self.records.snapshot();
        self.events.emit(&MonitorEvent::Change(snapshot.clone()));
        snapshot
    }
}

// ---------------------------------------------------------------------------
// DiscoverOptions / DiscoveryHandle
// ---------------------------------------------------------------------------

/// Options for one discovery window.
#[derive(Debug, Clone, Default)]
pub struct DiscoverOptions {
    /// Keep records from earlier sightings instead of clearing first.
    pub do_not_clear: bool,
    /// Only ask instances of this service (`$SRV.INFO.<name>`).
    pub service: Option<String>,
}

impl DiscoverOptions {
    #[must_use]
    pub fn keep_existing() -> Self {
        Self {
            do_not_clear: true,
            service: None,
        }
    }
}

/// A running discovery window.
///
/// Awaiting it yields the registry snapshot taken when the window closed.
/// Dropping it detaches the window, which still runs to completion.
#[derive(Debug)]
pub struct DiscoveryHandle {
    task: JoinHandle<Result<Vec<ServiceRecord>, TransportError>>,
    token: CancellationToken,
}

impl DiscoveryHandle {
    /// Closes the window early. The handle then resolves with the records
    /// collected so far and no `Change` event is emitted.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for DiscoveryHandle {
    type Output = Result<Vec<ServiceRecord>, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().task)
            .poll(cx)
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(TransportError::Other(anyhow::anyhow!("discovery task failed: {e}"))),
            })
    }
}

// ---------------------------------------------------------------------------
// Discoverer
// ---------------------------------------------------------------------------

/// Starts discovery windows. Cheap to clone; the periodic schedule holds one.
#[derive(Clone)]
pub(crate) struct Discoverer {
    pub transport: Arc<dyn Transport>,
    pub shared: Arc<Shared>,
    /// Parent of every window token; cancelled when the monitor closes.
    pub shutdown: CancellationToken,
}

impl Discoverer {
    pub fn discover(&self, timeout: Duration, options: DiscoverOptions) -> DiscoveryHandle {
        if !options.do_not_clear {
            self.shared.records.clear();
        }
        let subject = DiscoveryVerb::Info.subject(options.service.as_deref(), None);
        let token = self.shutdown.child_token();
        let task = tokio::spawn(run_window(
            self.transport.clone(),
            self.shared.clone(),
            subject,
            timeout,
            token.clone(),
        ));
        DiscoveryHandle { task, token }
    }
}

async fn run_window(
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    subject: String,
    timeout: Duration,
    token: CancellationToken,
) -> Result<Vec<ServiceRecord>, TransportError> {
    let inbox = transport.new_inbox();
    let mut replies = transport.subscribe(&inbox, None).await?;
    let request = Message::new(subject.clone(), Bytes::new()).with_reply(inbox);
    if let Err(e) = transport.publish(request).await {
        let _ = transport.unsubscribe(replies.id).await;
        return Err(e);
    }
    debug!(%subject, ?timeout, "discovery window open");

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut cancelled = false;
    let mut seen = 0usize;

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                cancelled = true;
                break;
            }
            () = &mut deadline => break,
            reply = replies.next() => match reply {
                Some(message) => match serde_json::from_slice::<InfoResponse>(&message.payload) {
                    Ok(info) => {
                        seen += 1;
                        shared.observe(info);
                    }
                    Err(e) => trace!(error = %e, "ignoring malformed discovery reply"),
                },
                None => break,
            },
        }
    }

    if let Err(e) = transport.unsubscribe(replies.id).await {
        trace!(error = %e, "discovery inbox already gone");
    }
    debug!(%subject, replies = seen, cancelled, "discovery window closed");

    if cancelled {
        Ok(shared.records.snapshot())
    } else {
        Ok(shared.emit_change())
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Applies `$SRV.REG` announcements: `Added` for new ids, then `Change`.
pub(crate) async fn listen_announcements(mut subscription: Subscription, shared: Arc<Shared>) {
    while let Some(message) = subscription.next().await {
        match serde_json::from_slice::<InfoResponse>(&message.payload) {
            Ok(info) => {
                debug!(service = %info.identity.name, instance = %info.identity.id, "announcement");
                shared.observe(info);
                shared.emit_change();
            }
            Err(e) => trace!(error = %e, "ignoring malformed announcement"),
        }
    }
}

/// Applies disconnect advisories: `Removed` per dropped record, then `Change`.
pub(crate) async fn listen_disconnects(mut subscription: Subscription, shared: Arc<Shared>) {
    while let Some(message) = subscription.next().await {
        let advisory = match serde_json::from_slice::<DisconnectAdvisory>(&message.payload) {
            Ok(advisory) => advisory,
            Err(e) => {
                trace!(error = %e, "ignoring malformed disconnect advisory");
                continue;
            }
        };
        let removed = shared
            .records
            .remove_by_client(advisory.client.id, advisory.client.acc.as_deref());
        if removed.is_empty() {
            continue;
        }
        for record in removed {
            debug!(
                service = %record.name,
                instance = %record.id,
                client_id = advisory.client.id,
                "instance disconnected"
            );
            shared.events.emit(&MonitorEvent::Removed(record));
        }
        shared.emit_change();
    }
}
