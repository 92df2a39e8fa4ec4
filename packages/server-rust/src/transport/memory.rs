//! In-process broker implementing the [`Transport`] contract.
//!
//! Subscriptions live in a `DashMap` keyed by a broker-wide id. Queue groups
//! are served round-robin per group name, so balanced delivery is exactly
//! fair. Closing a connection drops its subscriptions and publishes a
//! disconnect advisory on `$SYS.ACCOUNT.<account>.DISCONNECT`, which only
//! system connections may subscribe to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use microbus_core::subject::{disconnect_subject, is_valid_subject, subject_matches};
use microbus_core::{
    ClientInfo, ConnectionInfo, DisconnectAdvisory, Headers, Message, Subscription,
    SubscriptionId, Transport, TransportError,
};

const SYSTEM_PREFIX: &str = "$SYS.";
const DEFAULT_ACCOUNT: &str = "APP";

/// Options for opening a connection to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub account: String,
    pub user: Option<String>,
    pub ip: String,
    pub name: Option<String>,
    /// System connections may subscribe to `$SYS.>` advisories.
    pub system: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            account: DEFAULT_ACCOUNT.to_string(),
            user: None,
            ip: "127.0.0.1".to_string(),
            name: None,
            system: false,
        }
    }
}

#[derive(Debug)]
struct SubscriptionEntry {
    client_id: u64,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    subscriptions: DashMap<u64, SubscriptionEntry>,
    queue_cursors: DashMap<String, AtomicUsize>,
    next_client_id: AtomicU64,
    next_subscription_id: AtomicU64,
}

impl BrokerInner {
    /// Routes a message to every matching plain subscriber and to one member
    /// of each matching queue group. Returns the number of deliveries.
    fn route(&self, message: &Message) -> usize {
        let mut fanout = Vec::new();
        // Queue groups are scoped by (pattern, group name), as on a real server.
        let mut groups: BTreeMap<(String, String), Vec<(u64, mpsc::UnboundedSender<Message>)>> =
            BTreeMap::new();

        for entry in &self.subscriptions {
            let sub = entry.value();
            if sub.tx.is_closed() || !subject_matches(&sub.pattern, &message.subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups
                    .entry((sub.pattern.clone(), group.clone()))
                    .or_default()
                    .push((*entry.key(), sub.tx.clone())),
                None => fanout.push(sub.tx.clone()),
            }
        }

        let mut delivered = 0;
        for tx in fanout {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        for ((pattern, group), mut members) in groups {
            // Stable member order keeps the round-robin cursor meaningful.
            members.sort_by_key(|(id, _)| *id);
            let cursor = self
                .queue_cursors
                .entry(format!("{pattern} {group}"))
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed);
            let (_, tx) = &members[cursor % members.len()];
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(subject = %message.subject, delivered, "routed message");
        delivered
    }

    fn has_interest(&self, subject: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| !entry.tx.is_closed() && subject_matches(&entry.pattern, subject))
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared in-process broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection with default options.
    #[must_use]
    pub fn connect(&self) -> Arc<MemoryConnection> {
        self.connect_with(ConnectOptions::default())
    }

    /// Opens a privileged connection allowed to read system advisories.
    #[must_use]
    pub fn connect_system(&self) -> Arc<MemoryConnection> {
        self.connect_with(ConnectOptions {
            account: "SYS".to_string(),
            system: true,
            ..ConnectOptions::default()
        })
    }

    /// Opens a connection. Client ids start at 1.
    #[must_use]
    pub fn connect_with(&self, options: ConnectOptions) -> Arc<MemoryConnection> {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(client_id, account = %options.account, "client connected");
        Arc::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            client_id,
            options,
            closed: AtomicBool::new(false),
            next_inbox: AtomicU64::new(0),
        })
    }

    /// Number of live subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// One client connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    broker: Arc<BrokerInner>,
    client_id: u64,
    options: ConnectOptions,
    closed: AtomicBool,
    next_inbox: AtomicU64,
}

impl MemoryConnection {
    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection: drops its subscriptions and publishes a
    /// disconnect advisory for its account. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broker
            .subscriptions
            .retain(|_, sub| sub.client_id != self.client_id);

        let advisory = DisconnectAdvisory::new(
            ClientInfo {
                id: self.client_id,
                host: Some(self.options.ip.clone()),
                acc: Some(self.options.account.clone()),
                user: self.options.user.clone(),
                name: self.options.name.clone(),
            },
            Some("Client Closed".to_string()),
        );
        match serde_json::to_vec(&advisory) {
            Ok(body) => {
                self.broker.route(&Message::new(
                    disconnect_subject(&self.options.account),
                    body,
                ));
            }
            Err(e) => debug!(error = %e, "failed to encode disconnect advisory"),
        }
        debug!(client_id = self.client_id, "client disconnected");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn publish(&self, message: Message) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !is_valid_subject(&message.subject) || message.subject.contains(['*', '>']) {
            return Err(TransportError::InvalidSubject(message.subject));
        }
        self.broker.route(&message);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        if !is_valid_subject(subject) {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
        if subject.starts_with(SYSTEM_PREFIX) && !self.options.system {
            return Err(TransportError::PermissionDenied(subject.to_string()));
        }
        let id = self
            .broker
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.subscriptions.insert(
            id,
            SubscriptionEntry {
                client_id: self.client_id,
                pattern: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                tx,
            },
        );
        Ok(Subscription::new(
            SubscriptionId(id),
            subject.to_string(),
            queue_group.map(str::to_string),
            rx,
        ))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let removed = self
            .broker
            .subscriptions
            .remove_if(&id.0, |_, sub| sub.client_id == self.client_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(TransportError::SubscriptionNotFound(id)),
        }
    }

    fn new_inbox(&self) -> String {
        let n = self.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("_INBOX.{}.{n}", self.client_id)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.client_id,
            ip: Some(self.options.ip.clone()),
            account: Some(self.options.account.clone()),
            user: self.options.user.clone(),
        }
    }

    async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        self.ensure_open()?;
        if !self.broker.has_interest(subject) {
            return Err(TransportError::NoResponders {
                subject: subject.to_string(),
            });
        }
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox, None).await?;
        self.publish(Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers,
            payload,
        })
        .await?;
        let reply = tokio::time::timeout(timeout, sub.next()).await;
        let _ = self.unsubscribe(sub.id).await;
        match reply {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::Closed),
            #[allow(clippy::cast_possible_truncation)]
            Err(_elapsed) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_subscribers_all_receive() {
        let broker = MemoryBroker::new();
        let a = broker.connect();
        let b = broker.connect();
        let mut sa = a.subscribe("x.y", None).await.unwrap();
        let mut sb = b.subscribe("x.*", None).await.unwrap();

        a.publish(Message::new("x.y", "hi")).await.unwrap();

        assert_eq!(sa.next().await.unwrap().payload, Bytes::from("hi"));
        assert_eq!(sb.next().await.unwrap().payload, Bytes::from("hi"));
    }

    #[tokio::test]
    async fn queue_group_round_robins() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut s1 = conn.subscribe("work", Some("g")).await.unwrap();
        let mut s2 = conn.subscribe("work", Some("g")).await.unwrap();

        for i in 0..4 {
            conn.publish(Message::new("work", format!("{i}"))).await.unwrap();
        }

        assert_eq!(s1.next().await.unwrap().payload, Bytes::from("0"));
        assert_eq!(s2.next().await.unwrap().payload, Bytes::from("1"));
        assert_eq!(s1.next().await.unwrap().payload, Bytes::from("2"));
        assert_eq!(s2.next().await.unwrap().payload, Bytes::from("3"));
    }

    #[tokio::test]
    async fn request_without_responders_fails_fast() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let err = conn
            .request("nobody.home", Headers::new(), Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoResponders { .. }));
    }

    #[tokio::test]
    async fn request_receives_reply() {
        let broker = MemoryBroker::new();
        let server = broker.connect();
        let client = broker.connect();
        let mut sub = server.subscribe("svc.ping", None).await.unwrap();
        let server_task = tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            server
                .publish(Message::new(msg.reply.unwrap(), "pong"))
                .await
                .unwrap();
        });

        let reply = client
            .request("svc.ping", Headers::new(), Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from("pong"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn system_subjects_require_privilege() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let err = conn
            .subscribe("$SYS.ACCOUNT.*.DISCONNECT", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn close_drops_subscriptions_and_emits_advisory() {
        let broker = MemoryBroker::new();
        let system = broker.connect_system();
        let mut advisories = system
            .subscribe("$SYS.ACCOUNT.*.DISCONNECT", None)
            .await
            .unwrap();

        let conn = broker.connect();
        let mut sub = conn.subscribe("x", None).await.unwrap();
        conn.close();
        conn.close();

        assert!(sub.next().await.is_none());
        let msg = advisories.next().await.unwrap();
        assert_eq!(msg.subject, "$SYS.ACCOUNT.APP.DISCONNECT");
        let advisory: DisconnectAdvisory = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(advisory.client.id, conn.client_id());
        assert!(matches!(
            conn.publish(Message::new("x", "")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_is_owner_scoped() {
        let broker = MemoryBroker::new();
        let a = broker.connect();
        let b = broker.connect();
        let sub = a.subscribe("x", None).await.unwrap();
        assert!(b.unsubscribe(sub.id).await.is_err());
        assert!(a.unsubscribe(sub.id).await.is_ok());
        assert_eq!(broker.subscription_count(), 0);
    }
}
