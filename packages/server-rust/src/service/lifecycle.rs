//! Microservice lifecycle state with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state reads from dispatch tasks and an
//! atomic counter with RAII guards so `stop` can drain outstanding requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Instance state.
///
/// State machine: Created -> Started -> Stopped -> Started -> ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built, never started. No subscriptions.
    Created,
    /// Subscribed and dispatching.
    Started,
    /// Unsubscribed. May be started again with the same identity.
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared lifecycle handle, held by the runtime and every dispatch task.
#[derive(Debug)]
pub struct LifecycleController {
    state: ArcSwap<LifecycleState>,
    in_flight: Arc<AtomicU64>,
}

impl LifecycleController {
    /// Creates a controller in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Created),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.state.store(Arc::new(state));
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    /// Tracks one in-flight request until the guard is dropped, including on panic.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for all in-flight requests to complete, up to `timeout`.
    ///
    /// Returns `false` if the deadline passed with requests still running.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
