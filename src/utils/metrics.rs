use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::StrategyKind;

/// Most recent gateway latency samples kept for avg/percentiles
const LATENCY_WINDOW: usize = 1000;

/// Global metrics collector for the application.
///
/// Tracks probes, conversions, storage calls and batch outcomes.
/// Thread-safe and can be shared across the application.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Probe Metrics
    probes_total: AtomicUsize,
    probes_unknown: AtomicUsize,

    // Gateway Metrics
    gateway_calls_success: AtomicUsize,
    gateway_calls_failed: AtomicUsize,
    gateway_latency_ms: RwLock<VecDeque<u64>>,

    // Local conversion Metrics
    local_direct_fetch: AtomicUsize,
    local_element_load: AtomicUsize,
    local_failed: AtomicUsize,

    // Storage Metrics
    uploads_total: AtomicUsize,
    delete_failures: AtomicUsize,

    // Batch Metrics
    scan_windows: AtomicUsize,
    items_succeeded: AtomicUsize,
    items_failed: AtomicUsize,
    items_timed_out: AtomicUsize,
    runs_completed: AtomicUsize,
    runs_cancelled: AtomicUsize,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    // Circuit breaker state tracking
    circuit_breaker_trips: AtomicUsize,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                probes_total: AtomicUsize::new(0),
                probes_unknown: AtomicUsize::new(0),
                gateway_calls_success: AtomicUsize::new(0),
                gateway_calls_failed: AtomicUsize::new(0),
                gateway_latency_ms: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW)),
                local_direct_fetch: AtomicUsize::new(0),
                local_element_load: AtomicUsize::new(0),
                local_failed: AtomicUsize::new(0),
                uploads_total: AtomicUsize::new(0),
                delete_failures: AtomicUsize::new(0),
                scan_windows: AtomicUsize::new(0),
                items_succeeded: AtomicUsize::new(0),
                items_failed: AtomicUsize::new(0),
                items_timed_out: AtomicUsize::new(0),
                runs_completed: AtomicUsize::new(0),
                runs_cancelled: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Probe Metrics
    pub fn record_probe(&self, size: u64) {
        self.inner.probes_total.fetch_add(1, Ordering::Relaxed);
        if size == 0 {
            self.inner.probes_unknown.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Gateway Metrics
    pub fn record_gateway_call(&self, success: bool, duration: Duration) {
        if success {
            self.inner.gateway_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.gateway_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut latency = self.inner.gateway_latency_ms.write();
        if latency.len() == LATENCY_WINDOW {
            latency.pop_front();
        }
        latency.push_back(duration.as_millis() as u64);
    }

    // Local conversion Metrics
    pub fn record_local_conversion(&self, strategy: Option<StrategyKind>) {
        let counter = match strategy {
            Some(StrategyKind::DirectFetch) => &self.inner.local_direct_fetch,
            Some(StrategyKind::ElementLoad) => &self.inner.local_element_load,
            None => &self.inner.local_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // Storage Metrics
    pub fn record_upload(&self) {
        self.inner.uploads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_failure(&self) {
        self.inner.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Batch Metrics
    pub fn record_scan_window(&self) {
        self.inner.scan_windows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item(&self, success: bool, timed_out: bool) {
        if success {
            self.inner.items_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.items_failed.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.inner.items_timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_run_finished(&self, cancelled: bool) {
        if cancelled {
            self.inner.runs_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.runs_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Circuit Breaker Metrics
    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency: Vec<u64> = self.inner.gateway_latency_ms.read().iter().copied().collect();
        let gateway_latency_avg_ms = avg(&latency);
        let gateway_latency_p50_ms = percentile(&latency, 0.5);
        let gateway_latency_p95_ms = percentile(&latency, 0.95);

        let endpoint_requests = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            probes_total: self.inner.probes_total.load(Ordering::Relaxed),
            probes_unknown: self.inner.probes_unknown.load(Ordering::Relaxed),
            gateway_calls_success: self.inner.gateway_calls_success.load(Ordering::Relaxed),
            gateway_calls_failed: self.inner.gateway_calls_failed.load(Ordering::Relaxed),
            gateway_latency_avg_ms,
            gateway_latency_p50_ms,
            gateway_latency_p95_ms,
            local_direct_fetch: self.inner.local_direct_fetch.load(Ordering::Relaxed),
            local_element_load: self.inner.local_element_load.load(Ordering::Relaxed),
            local_failed: self.inner.local_failed.load(Ordering::Relaxed),
            uploads_total: self.inner.uploads_total.load(Ordering::Relaxed),
            delete_failures: self.inner.delete_failures.load(Ordering::Relaxed),
            scan_windows: self.inner.scan_windows.load(Ordering::Relaxed),
            items_succeeded: self.inner.items_succeeded.load(Ordering::Relaxed),
            items_failed: self.inner.items_failed.load(Ordering::Relaxed),
            items_timed_out: self.inner.items_timed_out.load(Ordering::Relaxed),
            runs_completed: self.inner.runs_completed.load(Ordering::Relaxed),
            runs_cancelled: self.inner.runs_cancelled.load(Ordering::Relaxed),
            endpoint_requests,
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP probes_total Size probes issued
# TYPE probes_total counter
probes_total {{}} {}

# HELP probes_unknown_total Size probes that returned no usable size
# TYPE probes_unknown_total counter
probes_unknown_total {{}} {}

# HELP gateway_calls_total Conversion endpoint calls by outcome
# TYPE gateway_calls_total counter
gateway_calls_total {{outcome="success"}} {}
gateway_calls_total {{outcome="failed"}} {}

# HELP gateway_latency_avg_ms Average conversion endpoint latency in milliseconds
# TYPE gateway_latency_avg_ms gauge
gateway_latency_avg_ms {{}} {}

# HELP local_conversions_total Local conversions by strategy
# TYPE local_conversions_total counter
local_conversions_total {{strategy="direct_fetch"}} {}
local_conversions_total {{strategy="element_load"}} {}
local_conversions_total {{strategy="failed"}} {}

# HELP uploads_total Assets written to storage
# TYPE uploads_total counter
uploads_total {{}} {}

# HELP delete_failures_total Old assets that could not be removed
# TYPE delete_failures_total counter
delete_failures_total {{}} {}

# HELP scan_windows_total Scan windows processed
# TYPE scan_windows_total counter
scan_windows_total {{}} {}

# HELP batch_items_total Batch items by outcome
# TYPE batch_items_total counter
batch_items_total {{outcome="success"}} {}
batch_items_total {{outcome="failed"}} {}
batch_items_total {{outcome="timeout"}} {}

# HELP batch_runs_total Batch runs by outcome
# TYPE batch_runs_total counter
batch_runs_total {{outcome="completed"}} {}
batch_runs_total {{outcome="cancelled"}} {}

# HELP circuit_breaker_trips_total Total circuit breaker trips
# TYPE circuit_breaker_trips_total counter
circuit_breaker_trips_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.probes_total,
            snapshot.probes_unknown,
            snapshot.gateway_calls_success,
            snapshot.gateway_calls_failed,
            snapshot.gateway_latency_avg_ms,
            snapshot.local_direct_fetch,
            snapshot.local_element_load,
            snapshot.local_failed,
            snapshot.uploads_total,
            snapshot.delete_failures,
            snapshot.scan_windows,
            snapshot.items_succeeded,
            snapshot.items_failed,
            snapshot.items_timed_out,
            snapshot.runs_completed,
            snapshot.runs_cancelled,
            snapshot.circuit_breaker_trips,
            snapshot.uptime_seconds,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub probes_total: usize,
    pub probes_unknown: usize,
    pub gateway_calls_success: usize,
    pub gateway_calls_failed: usize,
    pub gateway_latency_avg_ms: u64,
    pub gateway_latency_p50_ms: u64,
    pub gateway_latency_p95_ms: u64,
    pub local_direct_fetch: usize,
    pub local_element_load: usize,
    pub local_failed: usize,
    pub uploads_total: usize,
    pub delete_failures: usize,
    pub scan_windows: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub items_timed_out: usize,
    pub runs_completed: usize,
    pub runs_cancelled: usize,
    pub endpoint_requests: std::collections::BTreeMap<String, usize>,
    pub circuit_breaker_trips: usize,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
