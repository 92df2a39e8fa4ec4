//! Load-shedding middleware for dispatched requests.
//!
//! Rejects requests when the instance already runs `max_concurrent_requests`
//! chains, answering with `DispatchError::Overloaded` instead of queueing.
//! Sits inside the metrics layer, so shed requests still show up in stats
//! as `503` errors.

use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::operation::{DispatchError, DispatchFuture, DispatchResponse, InboundRequest};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent requests via a shared semaphore.
///
/// Every service produced by one layer shares the same permits, so clones
/// handed to different subscription readers enforce a single instance-wide limit.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<InboundRequest> for LoadShedService<S>
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
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Box::pin(async { Err(DispatchError::Overloaded) });
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
