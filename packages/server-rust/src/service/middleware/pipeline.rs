//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::RuntimeConfig;
use crate::service::operation::{DispatchError, DispatchResponse, InboundRequest};
use crate::service::router::MethodRouter;
use crate::service::stats::StatsRegistry;

/// Type-erased dispatch stack, cloned into every subscription reader.
pub type DispatchService = BoxCloneService<InboundRequest, DispatchResponse, DispatchError>;

/// Build the dispatch pipeline by wrapping the `MethodRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- record timing and outcome, including sheds and timeouts
/// 2. `LoadShedLayer` -- reject when overloaded, before the chain does any work
/// 3. `TimeoutLayer` -- enforce the per-request budget
#[must_use]
pub fn build_dispatch_pipeline(
    service: &str,
    router: MethodRouter,
    config: &RuntimeConfig,
    stats: Arc<StatsRegistry>,
) -> DispatchService {
    let stack = ServiceBuilder::new()
        .layer(MetricsLayer::new(service, stats))
        .layer(LoadShedLayer::new(config.max_concurrent_requests))
        .layer(TimeoutLayer::new(config.request_timeout_ms))
        .service(router);
    BoxCloneService::new(stack)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
