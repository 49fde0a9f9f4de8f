use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use fleet_common::{ClusterRecord, ClusterStatus};
use fleet_store::{ClusterDirectory, FleetStore};

use crate::error::SyncError;
use crate::inventory::WorkloadInventory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub workers: usize,
    /// Budget of one probe, connect included.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub running: usize,
    pub abnormal: usize,
    /// Probes that died before reporting.
    pub unknown: usize,
    /// Clusters whose stored status was rewritten.
    pub changed: usize,
    pub duration: Duration,
}

impl ProbeSummary {
    pub fn total(&self) -> usize {
        self.running + self.abnormal + self.unknown
    }
}

/// Liveness sweep over every registered cluster on a bounded pool.
pub struct ClusterProber {
    inventory: Arc<dyn WorkloadInventory>,
    store: Arc<dyn FleetStore>,
    config: ProbeConfig,
}

impl ClusterProber {
    pub fn new(inventory: Arc<dyn WorkloadInventory>, store: Arc<dyn FleetStore>, config: ProbeConfig) -> Self {
        Self {
            inventory,
            store,
            config,
        }
    }

    pub fn forget_cluster(&self, cluster_id: &str) {
        self.inventory.forget(cluster_id);
    }

    /// Probe all clusters. Only listing the directory can fail; a failing
    /// or crashing probe is confined to its own cluster.
    pub async fn probe_all(&self) -> Result<ProbeSummary, SyncError> {
        let started = Instant::now();
        let clusters = self.store.list_clusters().await.map_err(SyncError::Store)?;
        tracing::debug!(clusters = clusters.len(), workers = self.config.workers, "probing clusters");

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut join_set = JoinSet::new();
        for cluster in clusters {
            let sem = semaphore.clone();
            let inventory = self.inventory.clone();
            let store = self.store.clone();
            let timeout = self.config.timeout;

            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                probe_one(inventory.as_ref(), store.as_ref(), &cluster, timeout).await
            });
        }

        let mut summary = ProbeSummary::default();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((status, changed)) => {
                    match status {
                        ClusterStatus::Running => summary.running += 1,
                        ClusterStatus::Abnormal => summary.abnormal += 1,
                        ClusterStatus::Unknown => summary.unknown += 1,
                    }
                    if changed {
                        summary.changed += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "probe task failed");
                    summary.unknown += 1;
                }
            }
        }
        summary.duration = started.elapsed();

        tracing::info!(
            running = summary.running,
            abnormal = summary.abnormal,
            unknown = summary.unknown,
            changed = summary.changed,
            duration_ms = summary.duration.as_millis() as u64,
            "cluster probe finished"
        );
        Ok(summary)
    }
}

/// Returns the observed status and whether it was written.
async fn probe_one(
    inventory: &dyn WorkloadInventory,
    store: &dyn FleetStore,
    cluster: &ClusterRecord,
    timeout: Duration,
) -> (ClusterStatus, bool) {
    let status = match tokio::time::timeout(timeout, inventory.probe(cluster, timeout)).await {
        Ok(Ok(())) => ClusterStatus::Running,
        Ok(Err(e)) => {
            tracing::warn!(cluster = %cluster.name, error = %e, "cluster probe failed");
            ClusterStatus::Abnormal
        }
        Err(_) => {
            tracing::warn!(cluster = %cluster.name, timeout_ms = timeout.as_millis() as u64, "cluster probe timed out");
            ClusterStatus::Abnormal
        }
    };

    if status == cluster.cluster_status {
        return (status, false);
    }
    match store.set_cluster_status(&cluster.id, status).await {
        Ok(()) => {
            tracing::info!(cluster = %cluster.name, from = %cluster.cluster_status, to = %status, "cluster status changed");
            (status, true)
        }
        Err(e) => {
            tracing::warn!(cluster = %cluster.name, error = format!("{e:#}"), "failed to store cluster status");
            (status, false)
        }
    }
}
