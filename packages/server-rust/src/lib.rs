//! `microbus` server — microservice runtime, discovery responders, and the client-side monitor.

pub mod monitor;
pub mod service;
pub mod transport;

pub use monitor::{DiscoverOptions, DiscoveryHandle, Monitor, MonitorConfig, MonitorEvent};
pub use service::{
    handler_fn, middleware_fn, LifecycleState, MethodConfig, Microservice, MicroserviceBuilder,
    MicroserviceConfig, Request, RequestContext, RuntimeConfig, ServiceError,
};
pub use transport::{MemoryBroker, MemoryConnection};
