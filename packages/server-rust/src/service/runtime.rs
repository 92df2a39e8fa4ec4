//! Microservice runtime: lifecycle, subscriptions, and reply publishing.

use std::sync::Arc;
use std::time::Duration;

use microbus_core::{
    Endpoint, ErrorDescriptor, Headers, InfoResponse, Message, PingResponse, ServiceIdentity,
    StatsResponse, Subscription, SubscriptionId, Transport, ERROR_CODE_HEADER, ERROR_HEADER,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::config::RuntimeConfig;
use super::definition::MicroserviceConfig;
use super::discovery::{announce, discovery_subjects, serve_discovery, InstanceDescriptor};
use super::lifecycle::{LifecycleController, LifecycleState};
use super::middleware::{build_dispatch_pipeline, DispatchService};
use super::operation::{ConfigurationError, DispatchError, InboundRequest, Outcome, StartupError};
use super::router::{derive_routes, MethodRouter, Route};
use super::stats::StatsRegistry;

/// Subscriptions and reader tasks owned while started.
#[derive(Debug, Default)]
struct RunState {
    subscriptions: Vec<SubscriptionId>,
    readers: Vec<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    descriptor: Arc<InstanceDescriptor>,
    routes: Vec<Route>,
    router: MethodRouter,
    stats: Arc<StatsRegistry>,
    lifecycle: Arc<LifecycleController>,
    run: Mutex<RunState>,
}

/// One running instance of a microservice definition.
///
/// The instance id is generated once and kept across restarts, as are the
/// derived endpoints and the stats counters. Cloning yields another handle
/// to the same instance.
#[derive(Clone)]
pub struct Microservice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Microservice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microservice")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Microservice {
    /// Creates an instance with the default [`RuntimeConfig`]. Nothing is
    /// subscribed until [`Microservice::start`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::SubjectCollision` if two methods derive
    /// the same subject.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: MicroserviceConfig,
    ) -> Result<Self, ConfigurationError> {
        Self::with_config(transport, config, RuntimeConfig::default())
    }

    /// # Errors
    ///
    /// See [`Microservice::new`].
    pub fn with_config(
        transport: Arc<dyn Transport>,
        config: MicroserviceConfig,
        runtime: RuntimeConfig,
    ) -> Result<Self, ConfigurationError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let routes = derive_routes(&config.name, &id, &config.methods)?;
        let endpoints: Vec<Arc<Endpoint>> = routes.iter().map(|r| r.endpoint.clone()).collect();
        let stats = Arc::new(StatsRegistry::new(&endpoints));

        let descriptor = Arc::new(InstanceDescriptor::new(
            ServiceIdentity {
                name: config.name.clone(),
                id: id.clone(),
                version: config.version,
                metadata: config.metadata,
            },
            config.description,
            transport.connection_info(),
            routes.clone(),
            stats.clone(),
        ));

        let router = MethodRouter::new(&config.name, &id);

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                config: runtime,
                descriptor,
                routes,
                router,
                stats,
                lifecycle: Arc::new(LifecycleController::new()),
                run: Mutex::new(RunState::default()),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.descriptor.identity.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.descriptor.identity.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.descriptor.identity.version
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Derived endpoints in registration order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .routes
            .iter()
            .map(|route| route.endpoint.as_ref().clone())
            .collect()
    }

    #[must_use]
    pub fn ping(&self) -> PingResponse {
        self.inner.descriptor.ping()
    }

    #[must_use]
    pub fn info(&self) -> InfoResponse {
        self.inner.descriptor.info()
    }

    #[must_use]
    pub fn stats(&self) -> StatsResponse {
        self.inner.descriptor.stats()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.lifecycle.in_flight_count()
    }

    /// Subscribes every endpoint and the introspection subjects, then
    /// announces the instance. A no-op when already started.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if any subscription fails. Everything
    /// subscribed so far is removed and the previous state is kept.
    pub async fn start(&self) -> Result<(), StartupError> {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;
        if inner.lifecycle.is_started() {
            debug!(service = %self.name(), instance = %self.id(), "already started");
            return Ok(());
        }

        inner.router.install(&inner.routes);
        // One stack per run so every reader shares the same load-shed permits.
        let pipeline = build_dispatch_pipeline(
            self.name(),
            inner.router.clone(),
            &inner.config,
            inner.stats.clone(),
        );
        let mut started = RunState::default();

        for route in &inner.routes {
            let subject = &route.endpoint.subject;
            let subscription = match inner
                .transport
                .subscribe(subject, route.endpoint.queue_group.as_deref())
                .await
            {
                Ok(subscription) => subscription,
                Err(source) => {
                    self.rollback(started).await;
                    return Err(StartupError::Subscribe {
                        subject: subject.clone(),
                        source,
                    });
                }
            };
            started.subscriptions.push(subscription.id);
            started.readers.push(tokio::spawn(read_endpoint(
                subscription,
                route.endpoint.clone(),
                pipeline.clone(),
                inner.transport.clone(),
                inner.lifecycle.clone(),
            )));
        }

        for (verb, subject) in discovery_subjects(self.name(), self.id()) {
            let subscription = match inner.transport.subscribe(&subject, None).await {
                Ok(subscription) => subscription,
                Err(source) => {
                    self.rollback(started).await;
                    return Err(StartupError::Subscribe { subject, source });
                }
            };
            started.subscriptions.push(subscription.id);
            started.readers.push(tokio::spawn(serve_discovery(
                inner.transport.clone(),
                inner.descriptor.clone(),
                verb,
                subscription,
            )));
        }

        *run = started;
        inner.stats.mark_started();
        inner.lifecycle.set_state(LifecycleState::Started);

        if inner.config.announce {
            announce(inner.transport.as_ref(), &inner.descriptor).await;
        }

        info!(
            service = %self.name(),
            instance = %self.id(),
            version = %self.version(),
            endpoints = inner.routes.len(),
            "microservice started"
        );
        Ok(())
    }

    /// Unsubscribes everything and waits for in-flight requests, bounded by
    /// `drain_timeout_ms`. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;
        if !inner.lifecycle.is_started() {
            return;
        }

        inner.lifecycle.set_state(LifecycleState::Stopped);
        inner.router.clear();
        let state = std::mem::take(&mut *run);
        self.release(state).await;

        let drain = Duration::from_millis(inner.config.drain_timeout_ms);
        if !inner.lifecycle.wait_for_drain(drain).await {
            warn!(
                service = %self.name(),
                instance = %self.id(),
                in_flight = inner.lifecycle.in_flight_count(),
                "stopped before in-flight requests drained"
            );
        }
        info!(service = %self.name(), instance = %self.id(), "microservice stopped");
    }

    async fn rollback(&self, state: RunState) {
        warn!(
            service = %self.name(),
            instance = %self.id(),
            subscriptions = state.subscriptions.len(),
            "start failed, rolling back subscriptions"
        );
        self.inner.router.clear();
        self.release(state).await;
    }

    async fn release(&self, state: RunState) {
        for id in state.subscriptions {
            if let Err(e) = self.inner.transport.unsubscribe(id).await {
                debug!(subscription = id.0, error = %e, "unsubscribe failed");
            }
        }
        for reader in state.readers {
            reader.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Spawns one dispatch task per delivered message until the subscription ends.
async fn read_endpoint(
    mut subscription: Subscription,
    endpoint: Arc<Endpoint>,
    pipeline: DispatchService,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<LifecycleController>,
) {
    while let Some(message) = subscription.next().await {
        let guard = lifecycle.in_flight_guard();
        let request = InboundRequest {
            endpoint: endpoint.clone(),
            message,
        };
        let pipeline = pipeline.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let _guard = guard;
            dispatch(pipeline, transport.as_ref(), request).await;
        });
    }
}

async fn dispatch(pipeline: DispatchService, transport: &dyn Transport, request: InboundRequest) {
    let reply = request.message.reply.clone();
    let subject = request.message.subject.clone();

    let message = match pipeline.oneshot(request).await {
        Ok(response) => match response.outcome {
            Outcome::Reply { payload, headers } => reply.map(|to| Message {
                subject: to,
                reply: None,
                headers,
                payload,
            }),
            Outcome::Error { error, headers } => reply.map(|to| error_message(to, &error, headers)),
            Outcome::Suppressed => None,
        },
        Err(DispatchError::RoutingMiss { subject }) => {
            debug!(%subject, "no route for delivered message, dropping");
            return;
        }
        Err(err) => {
            debug!(%subject, error = %err, "dispatch failed");
            reply
                .zip(err.descriptor())
                .map(|(to, descriptor)| error_message(to, &descriptor, Headers::new()))
        }
    };

    let Some(message) = message else {
        return;
    };
    if let Err(e) = transport.publish(message).await {
        warn!(%subject, error = %e, "failed to publish reply");
    }
}

/// Error envelope: JSON descriptor body plus the service error headers.
fn error_message(reply: String, error: &ErrorDescriptor, mut headers: Headers) -> Message {
    headers.insert(ERROR_HEADER.to_string(), error.message.clone());
    headers.insert(ERROR_CODE_HEADER.to_string(), error.code.clone());
    let payload = serde_json::to_vec(error).unwrap_or_default();
    Message {
        subject: reply,
        reply: None,
        headers,
        payload: payload.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::service::definition::MethodConfig;
    use crate::service::handler::handler_fn;
    use crate::service::Request;
    use crate::transport::MemoryBroker;

    fn echo_config() -> MicroserviceConfig {
        MicroserviceConfig::builder("echo")
            .version("1.0.0")
            .method(
                "say",
                MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.payload) })),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn id_is_32_hex_chars() {
        let broker = MemoryBroker::new();
        let svc = Microservice::new(broker.connect(), echo_config()).unwrap();
        assert_eq!(svc.id().len(), 32);
        assert!(svc.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(svc.state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let broker = MemoryBroker::new();
        let svc = Microservice::new(broker.connect(), echo_config()).unwrap();
        svc.start().await.unwrap();
        let subscribed = broker.subscription_count();
        svc.start().await.unwrap();
        assert_eq!(broker.subscription_count(), subscribed);
        // one endpoint plus nine introspection subjects
        assert_eq!(subscribed, 10);
    }

    #[tokio::test]
    async fn stop_unsubscribes_and_is_idempotent() {
        let broker = MemoryBroker::new();
        let svc = Microservice::new(broker.connect(), echo_config()).unwrap();
        svc.start().await.unwrap();
        svc.stop().await;
        svc.stop().await;
        assert_eq!(svc.state(), LifecycleState::Stopped);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn request_round_trip() {
        let broker = MemoryBroker::new();
        let svc = Microservice::new(broker.connect(), echo_config()).unwrap();
        svc.start().await.unwrap();

        let client = broker.connect();
        let reply = client
            .request("echo.say", Headers::new(), Bytes::from("hi"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from("hi"));
        assert!(reply.service_error().is_none());
        assert_eq!(svc.stats().endpoints[0].num_requests, 1);
    }

    #[test]
    fn error_message_sets_headers_and_body() {
        let msg = error_message(
            "_INBOX.1".to_string(),
            &ErrorDescriptor::new("503", "busy"),
            Headers::new(),
        );
        assert_eq!(msg.service_error(), Some(("503", "busy")));
        let body: ErrorDescriptor = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body.code, "503");
    }
}
