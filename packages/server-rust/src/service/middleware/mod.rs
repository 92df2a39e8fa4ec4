//! Dispatch pipeline: the per-method chain and the tower layers around it.
//!
//! - [`chain`]: validator, pre-middleware, handler, post-middleware
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`metrics`]: Request spans, `metrics` facade, `$SRV.STATS` counters
//! - [`timeout`]: Per-request timeout enforcement
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod chain;
pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use chain::run_chain;
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchService};
pub use timeout::TimeoutLayer;
