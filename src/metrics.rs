/// src/metrics.rs - Process-wide counters behind the /metrics endpoint

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::artifacts::StoreStats;
use crate::core::RepairKind;

/// Thread-safe metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    // Request metrics
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    cancelled_requests: AtomicU64,

    // Streaming metrics
    active_streams: AtomicUsize,
    total_streams: AtomicU64,
    stream_errors: AtomicU64,

    // Repair outcomes, cumulative across artifact evictions
    artifacts_recorded: AtomicU64,
    artifacts_repaired: AtomicU64,
    artifacts_parse_ok: AtomicU64,
    repair_types: Arc<RwLock<HashMap<&'static str, u64>>>,

    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            cancelled_requests: AtomicU64::new(0),
            active_streams: AtomicUsize::new(0),
            total_streams: AtomicU64::new(0),
            stream_errors: AtomicU64::new(0),
            artifacts_recorded: AtomicU64::new(0),
            artifacts_repaired: AtomicU64::new(0),
            artifacts_parse_ok: AtomicU64::new(0),
            repair_types: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_cancelled(&self) {
        self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_start(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_end(&self, error: bool) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
        if error {
            self.stream_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one finalized extraction outcome.
    pub async fn record_repair_outcome(&self, repairs: &[RepairKind], parse_ok: bool) {
        self.artifacts_recorded.fetch_add(1, Ordering::Relaxed);
        if !repairs.is_empty() {
            self.artifacts_repaired.fetch_add(1, Ordering::Relaxed);
        }
        if parse_ok {
            self.artifacts_parse_ok.fetch_add(1, Ordering::Relaxed);
        }
        if !repairs.is_empty() {
            let mut types = self.repair_types.write().await;
            for repair in repairs {
                *types.entry(repair.as_str()).or_insert(0) += 1;
            }
        }
    }

    /// Snapshot merged with windowed aggregates from the artifact store.
    pub async fn snapshot(&self, store: &StoreStats) -> Value {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let recorded = self.artifacts_recorded.load(Ordering::Relaxed);
        let repaired = self.artifacts_repaired.load(Ordering::Relaxed);
        let parse_ok = self.artifacts_parse_ok.load(Ordering::Relaxed);
        let repair_types = self.repair_types.read().await;

        let rate = |num: u64, den: u64| -> f64 {
            if den > 0 {
                (num as f64 * 1000.0 / den as f64).round() / 1000.0
            } else {
                0.0
            }
        };

        json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "total_requests": total_requests,
            "failed_requests": self.failed_requests.load(Ordering::Relaxed),
            "cancelled_requests": self.cancelled_requests.load(Ordering::Relaxed),
            "repair_rate": rate(repaired, recorded),
            "parse_success_rate": rate(parse_ok, recorded),
            "repair_types": repair_types.iter().map(|(k, v)| ((*k).to_string(), json!(v))).collect::<HashMap<_, _>>(),
            "streaming": {
                "active_streams": self.active_streams.load(Ordering::Relaxed),
                "total_streams": self.total_streams.load(Ordering::Relaxed),
                "stream_errors": self.stream_errors.load(Ordering::Relaxed)
            },
            "store": {
                "retained": store.total,
                "repaired": store.repaired,
                "parse_success": store.parse_success
            },
            "last_updated": chrono::Utc::now().to_rfc3339()
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static GLOBAL_METRICS: std::sync::OnceLock<Arc<MetricsCollector>> = std::sync::OnceLock::new();

/// Initialize global metrics
pub fn init_global_metrics() {
    GLOBAL_METRICS.set(Arc::new(MetricsCollector::new())).ok();
}

/// Get global metrics instance
pub fn get_global_metrics() -> Option<&'static Arc<MetricsCollector>> {
    GLOBAL_METRICS.get()
}
