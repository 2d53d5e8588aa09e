//! Batch lifecycle telemetry
//!
//! Posts JSON breadcrumbs for each batch to the configured collector.
//! Telemetry is best-effort: failures are logged and never affect the
//! batch.

use std::time::Duration;

use serde_json::json;
use tracing::warn;

pub struct TelemetrySender {
    base_url: Option<String>,
    client: reqwest::Client,
}

impl TelemetrySender {
    /// `addr` is the `host:port` of the collector; `None` disables
    /// telemetry entirely.
    pub fn new(addr: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: addr.map(|a| format!("http://{a}")),
            client,
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) {
        let Some(base) = &self.base_url else {
            return;
        };
        let url = format!("{base}{path}");
        if let Err(e) = self.client.post(&url).json(&body).send().await {
            warn!(url, error = %e, "telemetry post failed");
        }
    }

    pub async fn batch_sealed(&self, merkle_root: &str, entry_count: usize) {
        self.post(
            "/api/batches/sealed",
            json!({ "merkle_root": merkle_root, "entries": entry_count }),
        )
        .await;
    }

    pub async fn batch_uploaded(&self, merkle_root: &str, data_pointer: &str) {
        self.post(
            "/api/batches/uploaded",
            json!({ "merkle_root": merkle_root, "data_pointer": data_pointer }),
        )
        .await;
    }

    pub async fn task_sent(&self, merkle_root: &str, tx_hash: &str) {
        self.post(
            "/api/batches/sent",
            json!({ "merkle_root": merkle_root, "tx_hash": tx_hash }),
        )
        .await;
    }

    pub async fn batch_confirmed(&self, merkle_root: &str) {
        self.post(
            "/api/batches/confirmed",
            json!({ "merkle_root": merkle_root }),
        )
        .await;
    }

    pub async fn batch_failed(&self, merkle_root: &str, reason: &str) {
        self.post(
            "/api/batches/failed",
            json!({ "merkle_root": merkle_root, "reason": reason }),
        )
        .await;
    }
}
