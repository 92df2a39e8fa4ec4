/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Window used by [`super::Monitor::refresh`] and periodic discovery
    /// when no explicit timeout is given.
    pub default_discover_timeout_ms: u64,
    /// Per-subscriber event queue capacity. Events for a full queue are dropped.
    pub event_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_discover_timeout_ms: 1_000,
            event_buffer: 256,
        }
    }
}
