//! Microservice runtime.
//!
//! This module implements the request path of a microservice instance:
//!
//! 1. **Definition** (`definition`, `registry`): explicit builder -> validated method table
//! 2. **Routing** (`router`): endpoint derivation and subject -> method resolution
//! 3. **Middleware** (`middleware`): per-method chain wrapped in tower layers
//!    (metrics, load shedding, timeout)
//! 4. **Runtime** (`runtime`): lifecycle, subscriptions, reply publishing
//! 5. **Discovery** (`discovery`): `$SRV` introspection replies and announcements

pub mod config;
pub mod context;
pub mod definition;
pub mod discovery;
pub mod handler;
pub mod lifecycle;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod stats;

// Re-export key types for convenient access.
pub use config::RuntimeConfig;
pub use context::{Request, RequestContext, Response, ResponseState, ServiceError};
pub use definition::{MethodConfig, MicroserviceBuilder, MicroserviceConfig};
pub use handler::{handler_fn, middleware_fn, Handler, IntoPayload, Middleware, Validator};
pub use lifecycle::LifecycleState;
pub use operation::{error_codes, ConfigurationError, DispatchError, StartupError};
pub use registry::{MethodRegistry, RegisteredMethod};
pub use router::MethodRouter;
pub use runtime::Microservice;
pub use stats::StatsRegistry;
