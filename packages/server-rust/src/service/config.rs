/// Runtime configuration for a microservice instance.
///
/// Controls request timeouts, concurrency limits, and shutdown draining.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of in-flight requests before load shedding.
    pub max_concurrent_requests: u32,
    /// Per-request timeout in milliseconds, covering validator, middleware and handler.
    pub request_timeout_ms: u64,
    /// How long `stop` waits for in-flight requests before giving up.
    pub drain_timeout_ms: u64,
    /// Publish a `$SRV.REG` announcement on start.
    pub announce: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 1000,
            request_timeout_ms: 30_000,
            drain_timeout_ms: 5_000,
            announce: true,
        }
    }
}
