//! Validator, pre-middleware, handler, post-middleware: the per-method chain.
//!
//! Every stage shares one [`RequestContext`]. A stage that closes the
//! response ends the chain; errors become error responses unless the
//! response is already closed.

use tracing::{debug, warn};

use crate::service::context::{RequestContext, ServiceError};
use crate::service::operation::error_codes;
use crate::service::registry::RegisteredMethod;

/// Runs the full chain of `method` against `ctx`.
pub async fn run_chain(method: &RegisteredMethod, ctx: &mut RequestContext) {
    if let Some(validator) = &method.config.validator {
        if let Err(reason) = validator.validate(&ctx.request) {
            debug!(method = %method.name, %reason, "request rejected by validator");
            ctx.response.error(error_codes::BAD_REQUEST, reason);
            return;
        }
    }

    for middleware in &method.config.middleware {
        if let Err(err) = middleware.handle(ctx).await {
            fail(ctx, &err, "middleware");
            return;
        }
        if ctx.response.is_closed() {
            return;
        }
    }

    match method.handler.call(ctx).await {
        // A payload after the handler closed the response is a second
        // terminal action; `send` warns and counts it.
        Ok(Some(payload)) => {
            ctx.response.send(payload);
        }
        Ok(None) => {}
        Err(err) => {
            fail(ctx, &err, "handler");
            return;
        }
    }

    for middleware in &method.config.post_middleware {
        if ctx.response.is_closed() {
            return;
        }
        if let Err(err) = middleware.handle(ctx).await {
            fail(ctx, &err, "post-middleware");
            return;
        }
    }
}

fn fail(ctx: &mut RequestContext, err: &anyhow::Error, stage: &'static str) {
    if ctx.response.is_closed() {
        warn!(
            method = %ctx.request.method,
            stage,
            error = %err,
            "error after response was closed"
        );
        return;
    }
    let descriptor = ServiceError::descriptor_for(err);
    debug!(method = %ctx.request.method, stage, code = %descriptor.code, "stage failed");
    ctx.response.error(descriptor.code, descriptor.message);
}
