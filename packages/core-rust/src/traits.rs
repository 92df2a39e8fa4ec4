use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::message::{Headers, Message};
use crate::protocol::ConnectionInfo;

/// Identifier of a live subscription, unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("subscription {0:?} not found")]
    SubscriptionNotFound(SubscriptionId),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("no responders for {subject}")]
    NoResponders { subject: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A live subscription. Messages arrive in publish order per publisher.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subject: String,
    pub queue_group: Option<String>,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        subject: String,
        queue_group: Option<String>,
        receiver: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            id,
            subject,
            queue_group,
            receiver,
        }
    }

    /// Waits for the next message. Returns `None` once the subscription is
    /// removed or the connection closes.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// Publish/subscribe transport the runtime and monitor are built on.
///
/// Implementations: in-memory broker (tests, demos); networked clients
/// plug in behind the same contract.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish a message. Fire-and-forget.
    async fn publish(&self, message: Message) -> Result<(), TransportError>;

    /// Subscribe to a subject or pattern. With a queue group, each message
    /// goes to exactly one member of the group.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError>;

    /// Remove a subscription. Its receiver yields `None` afterwards.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Generate a unique reply subject for this connection.
    fn new_inbox(&self) -> String;

    /// Transport identity of this connection.
    fn connection_info(&self) -> ConnectionInfo;

    /// Send a request and wait for the first reply.
    async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox, None).await?;
        let message = Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers,
            payload,
        };
        if let Err(e) = self.publish(message).await {
            let _ = self.unsubscribe(sub.id).await;
            return Err(e);
        }
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
