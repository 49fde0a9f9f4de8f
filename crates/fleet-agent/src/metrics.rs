use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

use fleet_engine::{ProbeSummary, TargetRegistry};

/// Counters and gauges of the serve loops, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    pub sync_passes_total: AtomicU64,
    pub sync_failures_total: AtomicU64,
    pub imports_total: AtomicU64,
    pub import_failures_total: AtomicU64,
    pub probe_batches_total: AtomicU64,
    /// Gauges from the latest probe batch.
    pub clusters_running: AtomicU64,
    pub clusters_abnormal: AtomicU64,
    pub clusters_unknown: AtomicU64,
    pub last_probe_duration_ms: AtomicU64,
}

impl SharedMetrics {
    pub fn record_probe(&self, summary: &ProbeSummary) {
        self.probe_batches_total.fetch_add(1, Ordering::Relaxed);
        self.clusters_running
            .store(summary.running as u64, Ordering::Relaxed);
        self.clusters_abnormal
            .store(summary.abnormal as u64, Ordering::Relaxed);
        self.clusters_unknown
            .store(summary.unknown as u64, Ordering::Relaxed);
        self.last_probe_duration_ms
            .store(summary.duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn render(&self, registry_failures: u64) -> String {
        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP fleet_agent_{name} {help}\n# TYPE fleet_agent_{name} {kind}\nfleet_agent_{name} {value}\n"
            ));
        };
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);

        metric("sync_passes_total", "counter", "Reconciliation passes attempted.", load(&self.sync_passes_total));
        metric("sync_failures_total", "counter", "Reconciliation passes that failed.", load(&self.sync_failures_total));
        metric("imports_total", "counter", "Cluster imports attempted.", load(&self.imports_total));
        metric("import_failures_total", "counter", "Cluster imports that failed.", load(&self.import_failures_total));
        metric("probe_batches_total", "counter", "Cluster probe batches run.", load(&self.probe_batches_total));
        metric("clusters_running", "gauge", "Clusters running at the last probe.", load(&self.clusters_running));
        metric("clusters_abnormal", "gauge", "Clusters abnormal at the last probe.", load(&self.clusters_abnormal));
        metric("clusters_unknown", "gauge", "Clusters whose probe crashed at the last probe.", load(&self.clusters_unknown));
        metric("last_probe_duration_ms", "gauge", "Wall time of the last probe batch.", load(&self.last_probe_duration_ms));
        metric("registry_failures_total", "counter", "Scrape target file updates that failed.", registry_failures);
        out
    }
}

#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<SharedMetrics>,
    pub registry: Arc<TargetRegistry>,
}

/// GET /metrics in Prometheus text exposition format.
pub async fn metrics_handler(State(st): State<MetricsState>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, st.metrics.render(st.registry.failures()))
}

/// GET /healthz
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_render_reflects_latest_probe() {
        let m = SharedMetrics::default();
        m.record_probe(&ProbeSummary {
            running: 4,
            abnormal: 1,
            unknown: 0,
            changed: 1,
            duration: Duration::from_millis(1250),
        });
        m.sync_failures_total.fetch_add(2, Ordering::Relaxed);

        let body = m.render(3);
        assert!(body.contains("fleet_agent_clusters_running 4\n"));
        assert!(body.contains("fleet_agent_clusters_abnormal 1\n"));
        assert!(body.contains("fleet_agent_probe_batches_total 1\n"));
        assert!(body.contains("fleet_agent_last_probe_duration_ms 1250\n"));
        assert!(body.contains("fleet_agent_sync_failures_total 2\n"));
        assert!(body.contains("# TYPE fleet_agent_registry_failures_total counter\nfleet_agent_registry_failures_total 3\n"));
    }
}
