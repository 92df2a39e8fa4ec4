//! Subject routing: derives endpoints for every method and dispatches
//! inbound requests to the method whose subscription received them.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use microbus_core::subject::patterns_overlap;
use microbus_core::{derive_endpoint, Endpoint};
use tower::Service;

use super::context::{Request, RequestContext};
use super::middleware::chain::run_chain;
use super::operation::{
    ConfigurationError, DispatchError, DispatchFuture, DispatchResponse, InboundRequest,
};
use super::registry::{MethodRegistry, RegisteredMethod};

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// One method bound to its derived endpoint.
#[derive(Debug, Clone)]
pub struct Route {
    pub endpoint: Arc<Endpoint>,
    pub method: Arc<RegisteredMethod>,
}

/// Derives the endpoint of every registered method, in registration order.
///
/// # Errors
///
/// Returns `ConfigurationError::SubjectCollision` if two methods' subjects
/// can match the same concrete subject, wildcard overrides included.
pub fn derive_routes(
    service: &str,
    instance_id: &str,
    registry: &MethodRegistry,
) -> Result<Vec<Route>, ConfigurationError> {
    let mut routes: Vec<Route> = Vec::with_capacity(registry.len());

    for (name, method) in registry.all() {
        let endpoint = derive_endpoint(
            service,
            instance_id,
            &name,
            method.config.subject.as_deref(),
            method.config.balancing,
        );
        // Overlapping subscriptions would answer one message twice.
        if let Some(first) = routes
            .iter()
            .find(|route| patterns_overlap(&route.endpoint.subject, &endpoint.subject))
        {
            return Err(ConfigurationError::SubjectCollision {
                first: first.method.name.clone(),
                second: name,
                subject: endpoint.subject,
            });
        }
        routes.push(Route {
            endpoint: Arc::new(endpoint),
            method,
        });
    }
    Ok(routes)
}

// ---------------------------------------------------------------------------
// MethodRouter
// ---------------------------------------------------------------------------

type RouteTable = HashMap<String, Route>;

/// Routes inbound requests to their method chain.
///
/// The table is keyed by endpoint subject and swapped atomically: installed
/// on start, emptied on stop. Clones share the table, so every subscription
/// reader sees the same routes.
#[derive(Debug, Clone)]
pub struct MethodRouter {
    routes: Arc<ArcSwap<RouteTable>>,
    service: Arc<str>,
    instance_id: Arc<str>,
}

impl MethodRouter {
    #[must_use]
    pub fn new(service: &str, instance_id: &str) -> Self {
        Self {
            routes: Arc::new(ArcSwap::from_pointee(RouteTable::new())),
            service: Arc::from(service),
            instance_id: Arc::from(instance_id),
        }
    }

    /// Replaces the live routing table.
    pub fn install(&self, routes: &[Route]) {
        let table: RouteTable = routes
            .iter()
            .map(|route| (route.endpoint.subject.clone(), route.clone()))
            .collect();
        self.routes.store(Arc::new(table));
    }

    /// Empties the routing table; later deliveries become routing misses.
    pub fn clear(&self) {
        self.routes.store(Arc::new(RouteTable::new()));
    }
}

impl Service<InboundRequest> for MethodRouter {
    type Response = DispatchResponse;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        // Keyed by the subscription's subject so wildcard overrides resolve
        // without a scan.
        let route = self.routes.load().get(&req.endpoint.subject).cloned();
        let service = self.service.clone();
        let instance_id = self.instance_id.clone();

        Box::pin(async move {
            let Some(route) = route else {
                return Err(DispatchError::RoutingMiss {
                    subject: req.message.subject,
                });
            };
            let method = route.method;
            let request = Request::from_message(req.message, &method.name, &service, &instance_id);
            let mut ctx = RequestContext::new(request);
            run_chain(&method, &mut ctx).await;
            Ok(DispatchResponse {
                method: method.name.clone(),
                outcome: ctx.response.into_outcome(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use microbus_core::{BalancingMode, Message};
    use tower::ServiceExt;

    use super::*;
    use crate::service::definition::MethodConfig;
    use crate::service::handler::handler_fn;
    use crate::service::operation::Outcome;

    fn echo() -> MethodConfig {
        MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.payload) }))
    }

    fn registry() -> MethodRegistry {
        let registry = MethodRegistry::new();
        registry.register("say", echo()).unwrap();
        registry.register("shout", echo().unbalanced()).unwrap();
        registry.register("whisper", echo().local()).unwrap();
        registry.register("any", echo().subject("custom.*.any")).unwrap();
        registry
    }

    #[test]
    fn derives_subjects_per_balancing_mode() {
        let routes = derive_routes("echo", "abc", &registry()).unwrap();
        let subjects: Vec<(&str, Option<&str>)> = routes
            .iter()
            .map(|r| (r.endpoint.subject.as_str(), r.endpoint.queue_group.as_deref()))
            .collect();
        assert_eq!(
            subjects,
            vec![
                ("echo.say", Some("echo")),
                ("echo.shout", None),
                ("echo.abc.whisper", None),
                ("custom.*.any", Some("echo")),
            ]
        );
        assert_eq!(routes[2].endpoint.balancing, BalancingMode::Local);
    }

    #[test]
    fn colliding_subjects_are_rejected() {
        let registry = MethodRegistry::new();
        registry.register("say", echo()).unwrap();
        registry.register("other", echo().subject("echo.say")).unwrap();

        let err = derive_routes("echo", "abc", &registry).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::SubjectCollision {
                first: "say".to_string(),
                second: "other".to_string(),
                subject: "echo.say".to_string(),
            }
        );
    }

    #[test]
    fn wildcard_override_overlapping_another_method_is_rejected() {
        let registry = MethodRegistry::new();
        registry.register("say", echo()).unwrap();
        registry.register("all", echo().subject("echo.*")).unwrap();

        let err = derive_routes("echo", "abc", &registry).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::SubjectCollision {
                first: "say".to_string(),
                second: "all".to_string(),
                subject: "echo.*".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn wildcard_route_dispatches_by_subscription_subject() {
        let router = MethodRouter::new("echo", "abc");
        let routes = derive_routes("echo", "abc", &registry()).unwrap();
        router.install(&routes);

        let req = InboundRequest {
            endpoint: routes[3].endpoint.clone(),
            message: Message::new("custom.x.any", "hi"),
        };
        let resp = router.clone().oneshot(req.clone()).await.unwrap();
        assert_eq!(resp.method, "any");

        router.clear();
        let err = router.oneshot(req).await.unwrap_err();
        assert!(matches!(err, DispatchError::RoutingMiss { subject } if subject == "custom.x.any"));
    }

    #[tokio::test]
    async fn dispatches_to_handler() {
        let router = MethodRouter::new("echo", "abc");
        let routes = derive_routes("echo", "abc", &registry()).unwrap();
        router.install(&routes);

        let req = InboundRequest {
            endpoint: routes[0].endpoint.clone(),
            message: Message::new("echo.say", "hello"),
        };
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.method, "say");
        assert!(matches!(resp.outcome, Outcome::Reply { payload, .. } if payload == Bytes::from("hello")));
    }

    #[tokio::test]
    async fn missing_route_is_a_routing_miss() {
        let router = MethodRouter::new("echo", "abc");
        let routes = derive_routes("echo", "abc", &registry()).unwrap();

        let req = InboundRequest {
            endpoint: routes[0].endpoint.clone(),
            message: Message::new("echo.say", "hello"),
        };
        let err = router.oneshot(req).await.unwrap_err();
        assert!(matches!(err, DispatchError::RoutingMiss { subject } if subject == "echo.say"));
    }
}
