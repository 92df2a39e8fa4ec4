//! `$SRV` introspection: ping/info/stats payloads and the responder loop.

use std::sync::Arc;

use bytes::Bytes;
use microbus_core::subject::REGISTRATION_SUBJECT;
use microbus_core::{
    ConnectionInfo, DiscoveryVerb, EndpointInfo, InfoResponse, Message, PingResponse,
    ServiceIdentity, StatsResponse, Subscription, Transport,
};
use tracing::{debug, warn};

use super::router::Route;
use super::stats::StatsRegistry;

/// Everything an instance reports about itself.
#[derive(Debug)]
pub struct InstanceDescriptor {
    pub identity: ServiceIdentity,
    pub description: String,
    pub connection: ConnectionInfo,
    routes: Vec<Route>,
    stats: Arc<StatsRegistry>,
}

impl InstanceDescriptor {
    #[must_use]
    pub fn new(
        identity: ServiceIdentity,
        description: String,
        connection: ConnectionInfo,
        routes: Vec<Route>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            identity,
            description,
            connection,
            routes,
            stats,
        }
    }

    #[must_use]
    pub fn ping(&self) -> PingResponse {
        PingResponse::new(self.identity.clone())
    }

    #[must_use]
    pub fn info(&self) -> InfoResponse {
        let endpoints = self
            .routes
            .iter()
            .map(|route| EndpointInfo {
                name: route.endpoint.method.clone(),
                subject: route.endpoint.subject.clone(),
                queue_group: route.endpoint.queue_group.clone(),
                metadata: route.method.config.metadata.clone(),
            })
            .collect();
        InfoResponse::new(
            self.identity.clone(),
            self.description.clone(),
            endpoints,
            Some(self.connection.clone()),
        )
    }

    #[must_use]
    pub fn stats(&self) -> StatsResponse {
        StatsResponse::new(
            self.identity.clone(),
            self.stats.started(),
            self.stats.snapshot(),
        )
    }

    /// JSON reply for one introspection verb.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn reply_for(&self, verb: DiscoveryVerb) -> Result<Bytes, serde_json::Error> {
        let body = match verb {
            DiscoveryVerb::Ping => serde_json::to_vec(&self.ping())?,
            DiscoveryVerb::Info => serde_json::to_vec(&self.info())?,
            DiscoveryVerb::Stats => serde_json::to_vec(&self.stats())?,
        };
        Ok(Bytes::from(body))
    }
}

/// The nine introspection subjects an instance answers on.
#[must_use]
pub fn discovery_subjects(name: &str, id: &str) -> Vec<(DiscoveryVerb, String)> {
    DiscoveryVerb::ALL
        .into_iter()
        .flat_map(|verb| verb.subjects_for(name, id).map(|subject| (verb, subject)))
        .collect()
}

/// Publishes the self-announcement. Failure is logged, never fatal.
pub async fn announce(transport: &dyn Transport, descriptor: &InstanceDescriptor) {
    let payload = match descriptor.reply_for(DiscoveryVerb::Info) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode announcement");
            return;
        }
    };
    if let Err(e) = transport
        .publish(Message::new(REGISTRATION_SUBJECT, payload))
        .await
    {
        warn!(
            service = %descriptor.identity.name,
            instance = %descriptor.identity.id,
            error = %e,
            "failed to publish announcement"
        );
    }
}

/// Answers every request arriving on one introspection subscription until
/// the subscription ends.
pub async fn serve_discovery(
    transport: Arc<dyn Transport>,
    descriptor: Arc<InstanceDescriptor>,
    verb: DiscoveryVerb,
    mut subscription: Subscription,
) {
    while let Some(request) = subscription.next().await {
        let Some(reply) = request.reply else {
            debug!(subject = %request.subject, "introspection request without reply subject");
            continue;
        };
        let payload = match descriptor.reply_for(verb) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%verb, error = %e, "failed to encode introspection reply");
                continue;
            }
        };
        if let Err(e) = transport.publish(Message::new(reply, payload)).await {
            debug!(%verb, error = %e, "failed to publish introspection reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use microbus_core::{derive_endpoint, BalancingMode};

    use super::*;
    use crate::service::definition::MethodConfig;
    use crate::service::handler::handler_fn;
    use crate::service::registry::MethodRegistry;
    use crate::service::router::derive_routes;
    use crate::service::Request;

    fn descriptor() -> InstanceDescriptor {
        let registry = MethodRegistry::new();
        registry
            .register(
                "say",
                MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.payload) }))
                    .metadata("kind", "echo"),
            )
            .unwrap();
        let routes = derive_routes("echo", "abc", &registry).unwrap();
        let endpoints: Vec<_> = routes.iter().map(|r| r.endpoint.clone()).collect();
        InstanceDescriptor::new(
            ServiceIdentity {
                name: "echo".to_string(),
                id: "abc".to_string(),
                version: "1.0.0".to_string(),
                metadata: HashMap::new(),
            },
            "echoes".to_string(),
            ConnectionInfo {
                client_id: 7,
                ip: None,
                account: Some("APP".to_string()),
                user: None,
            },
            routes,
            Arc::new(StatsRegistry::new(&endpoints)),
        )
    }

    #[test]
    fn nine_subjects_cover_every_scope() {
        let subjects = discovery_subjects("echo", "abc");
        assert_eq!(subjects.len(), 9);
        let names: Vec<&str> = subjects.iter().map(|(_, s)| s.as_str()).collect();
        assert!(names.contains(&"$SRV.PING"));
        assert!(names.contains(&"$SRV.INFO.echo"));
        assert!(names.contains(&"$SRV.STATS.echo.abc"));
    }

    #[test]
    fn info_lists_endpoints_and_connection() {
        let info = descriptor().info();
        assert_eq!(info.endpoints.len(), 1);
        assert_eq!(info.endpoints[0].subject, "echo.say");
        assert_eq!(info.endpoints[0].queue_group.as_deref(), Some("echo"));
        assert_eq!(info.endpoints[0].metadata.get("kind").map(String::as_str), Some("echo"));
        assert_eq!(info.connection.map(|c| c.client_id), Some(7));
    }

    #[test]
    fn replies_carry_type_tags() {
        let descriptor = descriptor();
        for (verb, tag) in [
            (DiscoveryVerb::Ping, "io.nats.micro.v1.ping_response"),
            (DiscoveryVerb::Info, "io.nats.micro.v1.info_response"),
            (DiscoveryVerb::Stats, "io.nats.micro.v1.stats_response"),
        ] {
            let json: serde_json::Value =
                serde_json::from_slice(&descriptor.reply_for(verb).unwrap()).unwrap();
            assert_eq!(json["type"], tag);
            assert_eq!(json["id"], "abc");
            assert_eq!(json["name"], "echo");
        }
    }

    #[test]
    fn stats_include_every_endpoint() {
        let endpoint = derive_endpoint("echo", "abc", "say", None, BalancingMode::Balanced);
        let stats = descriptor().stats();
        assert_eq!(stats.endpoints.len(), 1);
        assert_eq!(stats.endpoints[0].subject, endpoint.subject);
    }
}
