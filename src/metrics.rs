//! Metrics and the operational HTTP surface
//!
//! A small hand-rolled registry: named counters and gauges plus one
//! labeled counter for user-visible rejections, rendered in Prometheus
//! text format. An axum router serves `/metrics` and `/health` on the
//! configured metrics port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::get;
use axum::Router;

/// All batcher metrics. Cheap to share; every field is atomic.
#[derive(Default)]
pub struct Metrics {
    pub open_connections: Gauge,
    pub received_submissions: Counter,
    pub verified_submissions: Counter,
    pub queue_len: Gauge,
    pub queue_bytes: Gauge,
    pub sealed_batches: Counter,
    pub confirmed_batches: Counter,
    pub failed_batches: Counter,
    pub gas_price_last_batch: Gauge,
    pub upload_duration_ms: Gauge,
    pub submission_duration_ms: Gauge,
    pub rpc_degraded: Gauge,
    /// Rejections by reason label.
    rejections: Mutex<HashMap<&'static str, u64>>,
}

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one rejection under its reason label.
    pub fn rejection(&self, reason: &'static str) {
        let mut rejections = self.rejections.lock().expect("metrics lock poisoned");
        *rejections.entry(reason).or_insert(0) += 1;
    }

    pub fn rejection_count(&self, reason: &'static str) -> u64 {
        self.rejections
            .lock()
            .expect("metrics lock poisoned")
            .get(reason)
            .copied()
            .unwrap_or(0)
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let gauges = [
            ("batcher_open_connections", self.open_connections.get()),
            ("batcher_queue_len", self.queue_len.get()),
            ("batcher_queue_bytes", self.queue_bytes.get()),
            ("batcher_gas_price_last_batch", self.gas_price_last_batch.get()),
            ("batcher_upload_duration_ms", self.upload_duration_ms.get()),
            (
                "batcher_submission_duration_ms",
                self.submission_duration_ms.get(),
            ),
            ("batcher_rpc_degraded", self.rpc_degraded.get()),
        ];
        for (name, value) in gauges {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }

        let counters = [
            (
                "batcher_received_submissions_total",
                self.received_submissions.get(),
            ),
            (
                "batcher_verified_submissions_total",
                self.verified_submissions.get(),
            ),
            ("batcher_sealed_batches_total", self.sealed_batches.get()),
            (
                "batcher_confirmed_batches_total",
                self.confirmed_batches.get(),
            ),
            ("batcher_failed_batches_total", self.failed_batches.get()),
        ];
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }

        out.push_str("# TYPE batcher_rejections_total counter\n");
        let rejections = self.rejections.lock().expect("metrics lock poisoned");
        let mut reasons: Vec<_> = rejections.iter().collect();
        reasons.sort_by_key(|(reason, _)| **reason);
        for (reason, count) in reasons {
            out.push_str(&format!(
                "batcher_rejections_total{{reason=\"{reason}\"}} {count}\n"
            ));
        }

        out
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "service": "proof-batcher",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serve `/metrics` and `/health` until the process exits.
pub async fn serve(metrics: Arc<Metrics>, port: u16) -> std::io::Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "metrics server listening");
    axum::serve(listener, router).await
}
