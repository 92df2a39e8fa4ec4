//! Metrics middleware for dispatched requests.
//!
//! Wraps every request in an `info_span!`, feeds the `metrics` facade, and
//! updates the per-endpoint counters reported on `$SRV.STATS`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{
    DispatchError, DispatchFuture, DispatchResponse, InboundRequest, Outcome,
};
use crate::service::stats::StatsRegistry;

pub const REQUESTS_TOTAL: &str = "microbus_requests_total";
pub const REQUEST_ERRORS_TOTAL: &str = "microbus_request_errors_total";
pub const REQUEST_DURATION_SECONDS: &str = "microbus_request_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    service: Arc<str>,
    stats: Arc<StatsRegistry>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(service: &str, stats: Arc<StatsRegistry>) -> Self {
        Self {
            service: Arc::from(service),
            stats,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            service: self.service.clone(),
            stats: self.stats.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    service: Arc<str>,
    stats: Arc<StatsRegistry>,
}

impl<S> Service<InboundRequest> for MetricsService<S>
where
    S: Service<InboundRequest, Response = DispatchResponse, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = DispatchResponse;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        let service = self.service.clone();
        let stats = self.stats.clone();
        let method = req.endpoint.method.clone();

        let span = info_span!(
            "request",
            service = %service,
            method = %method,
            subject = %req.message.subject,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                if matches!(result, Err(DispatchError::RoutingMiss { .. })) {
                    return result;
                }
                let (outcome, error) = match &result {
                    Ok(DispatchResponse {
                        outcome: Outcome::Error { error, .. },
                        ..
                    }) => ("error", Some(error.clone())),
                    Ok(DispatchResponse {
                        outcome: Outcome::Suppressed,
                        ..
                    }) => ("suppressed", None),
                    Ok(_) => ("ok", None),
                    Err(err) => ("error", err.descriptor()),
                };

                stats.record(&method, elapsed, error.as_ref());

                ::metrics::counter!(
                    REQUESTS_TOTAL,
                    "service" => service.to_string(),
                    "method" => method.clone()
                )
                .increment(1);
                ::metrics::histogram!(
                    REQUEST_DURATION_SECONDS,
                    "service" => service.to_string(),
                    "method" => method.clone()
                )
                .record(elapsed.as_secs_f64());
                if let Some(error) = &error {
                    ::metrics::counter!(
                        REQUEST_ERRORS_TOTAL,
                        "service" => service.to_string(),
                        "method" => method.clone(),
                        "code" => error.code.clone()
                    )
                    .increment(1);
                }

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                tracing::info!(duration_ms, outcome, "request complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
