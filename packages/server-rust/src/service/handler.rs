//! Handler, middleware, and validator contracts plus closure adapters.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::context::{Request, RequestContext};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// The designated handler of a method.
///
/// A returned payload becomes the success reply unless the handler already
/// closed the response through `ctx.response`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<Option<Bytes>>;
}

/// Values a closure handler may return.
pub trait IntoPayload {
    fn into_payload(self) -> Option<Bytes>;
}

impl IntoPayload for () {
    fn into_payload(self) -> Option<Bytes> {
        None
    }
}

impl IntoPayload for Bytes {
    fn into_payload(self) -> Option<Bytes> {
        Some(self)
    }
}

impl IntoPayload for Vec<u8> {
    fn into_payload(self) -> Option<Bytes> {
        Some(Bytes::from(self))
    }
}

impl IntoPayload for String {
    fn into_payload(self) -> Option<Bytes> {
        Some(Bytes::from(self))
    }
}

impl IntoPayload for &'static str {
    fn into_payload(self) -> Option<Bytes> {
        Some(Bytes::from_static(self.as_bytes()))
    }
}

impl IntoPayload for serde_json::Value {
    fn into_payload(self) -> Option<Bytes> {
        serde_json::to_vec(&self).ok().map(Bytes::from)
    }
}

impl<T: IntoPayload> IntoPayload for Option<T> {
    fn into_payload(self) -> Option<Bytes> {
        self.and_then(IntoPayload::into_payload)
    }
}

/// Handler built from an async closure over an owned [`Request`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut, T> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: IntoPayload + Send + 'static,
{
    async fn call(&self, ctx: &mut RequestContext) -> anyhow::Result<Option<Bytes>> {
        let value = (self.0)(ctx.request.clone()).await?;
        Ok(value.into_payload())
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut, T>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: IntoPayload + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// A pre- or post-handler stage. Closing `ctx.response` short-circuits the
/// rest of the chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()>;
}

/// Middleware built from a synchronous closure.
pub struct FnMiddleware<F>(F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut RequestContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

/// Wraps a synchronous closure as middleware.
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(&mut RequestContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware(f))
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Pre-dispatch check on the raw request. A rejection is answered with a
/// `400` error before any middleware runs.
pub trait Validator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns the rejection reason sent back to the caller.
    fn validate(&self, request: &Request) -> Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&Request) -> Result<(), String> + Send + Sync + 'static,
{
    fn validate(&self, request: &Request) -> Result<(), String> {
        self(request)
    }
}
