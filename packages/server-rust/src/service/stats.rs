//! Per-endpoint request counters reported on `$SRV.STATS`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use microbus_core::{Endpoint, EndpointStats, ErrorDescriptor};
use parking_lot::{Mutex, RwLock};

#[derive(Debug, Default)]
struct EndpointCounters {
    num_requests: AtomicU64,
    num_errors: AtomicU64,
    /// Total processing time in nanoseconds.
    processing_time: AtomicU64,
    last_error: Mutex<String>,
}

/// Counters for every endpoint of one instance, keyed by method name.
///
/// The endpoint set is fixed at construction; counters survive restarts.
#[derive(Debug)]
pub struct StatsRegistry {
    endpoints: Vec<Arc<Endpoint>>,
    counters: HashMap<String, EndpointCounters>,
    started: RwLock<DateTime<Utc>>,
}

impl StatsRegistry {
    #[must_use]
    pub fn new(endpoints: &[Arc<Endpoint>]) -> Self {
        let counters = endpoints
            .iter()
            .map(|endpoint| (endpoint.method.clone(), EndpointCounters::default()))
            .collect();
        Self {
            endpoints: endpoints.to_vec(),
            counters,
            started: RwLock::new(Utc::now()),
        }
    }

    /// Records one finished request. Unknown methods are ignored.
    pub fn record(&self, method: &str, elapsed: Duration, error: Option<&ErrorDescriptor>) {
        let Some(counters) = self.counters.get(method) else {
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let nanos = elapsed.as_nanos() as u64;
        counters.num_requests.fetch_add(1, Ordering::Relaxed);
        counters.processing_time.fetch_add(nanos, Ordering::Relaxed);
        if let Some(error) = error {
            counters.num_errors.fetch_add(1, Ordering::Relaxed);
            *counters.last_error.lock() = error.to_string();
        }
    }

    pub fn mark_started(&self) {
        *self.started.write() = Utc::now();
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        *self.started.read()
    }

    /// Zeroes every counter. The start time is left alone.
    pub fn reset(&self) {
        for counters in self.counters.values() {
            counters.num_requests.store(0, Ordering::Relaxed);
            counters.num_errors.store(0, Ordering::Relaxed);
            counters.processing_time.store(0, Ordering::Relaxed);
            counters.last_error.lock().clear();
        }
    }

    /// Stats for every endpoint, in endpoint order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EndpointStats> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let mut stats = EndpointStats {
                    name: endpoint.method.clone(),
                    subject: endpoint.subject.clone(),
                    queue_group: endpoint.queue_group.clone(),
                    ..EndpointStats::default()
                };
                if let Some(counters) = self.counters.get(&endpoint.method) {
                    stats.num_requests = counters.num_requests.load(Ordering::Relaxed);
                    stats.num_errors = counters.num_errors.load(Ordering::Relaxed);
                    stats.processing_time = counters.processing_time.load(Ordering::Relaxed);
                    stats.last_error = counters.last_error.lock().clone();
                    if stats.num_requests > 0 {
                        stats.average_processing_time = stats.processing_time / stats.num_requests;
                    }
                }
                stats
            })
            .collect()
    }
}
