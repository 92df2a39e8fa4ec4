//! Timeout middleware for dispatched requests.
//!
//! Rejects requests whose chain exceeds the configured budget with
//! `DispatchError::Timeout`.

use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::service::operation::{DispatchError, DispatchFuture, DispatchResponse, InboundRequest};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing one request timeout for every method of an instance.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout_ms: u64,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout_ms: self.timeout_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout_ms: u64,
}

impl<S> Service<InboundRequest> for TimeoutService<S>
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
        let timeout_ms = self.timeout_ms;
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DispatchError::Timeout { timeout_ms }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
