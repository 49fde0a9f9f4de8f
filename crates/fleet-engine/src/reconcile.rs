use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{future, stream, StreamExt};
use tracing::Instrument;

use fleet_common::{
    now_ms, target_addr, ClusterRecord, ClusterStatus, HardwareSpecs, ImportStatus, K8sStatus, NodeRecord,
    NodeRole, SyncContext, TargetLabels,
};
use fleet_store::{ClusterDirectory, FleetStore, NodeInventory};

use crate::error::SyncError;
use crate::hardware::fetch_hardware_specs;
use crate::inventory::{NodeInfo, WorkloadInventory};
use crate::prometheus::MetricsQuery;
use crate::readiness::{wait_ready, ReadinessConfig};
use crate::registry::TargetRegistry;
use crate::task::{run_with_retry, RetryPolicy, TaskOutcome};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub list_timeout: Duration,
    pub fanout_workers: usize,
    pub metrics_task_timeout: Duration,
    pub exporter_port: u16,
    /// Rounds and interval of the post-registration wait; the port is
    /// always `exporter_port`.
    pub readiness: ReadinessConfig,
    pub write_retry: RetryPolicy,
    pub background_retry: RetryPolicy,
    /// Outer budget of a synchronous sync when the context carries none.
    pub sync_deadline: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(5),
            fanout_workers: 20,
            metrics_task_timeout: Duration::from_secs(3),
            exporter_port: 27684,
            readiness: ReadinessConfig::default(),
            write_retry: RetryPolicy::new(3, Duration::from_millis(200)),
            background_retry: RetryPolicy::default(),
            sync_deadline: Duration::from_secs(7),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub cluster_id: String,
    pub correlation_id: String,
    pub status: ClusterStatus,
    pub total: usize,
    pub not_ready: usize,
    /// Nodes that produced usable hardware readings.
    pub with_metrics: usize,
    pub targets_added: usize,
    /// `None` unless this was a full sync with targets to wait for.
    pub targets_ready: Option<bool>,
    /// Node writes that still failed after retrying.
    pub write_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecommissionReport {
    pub cluster_id: String,
    pub targets_removed: usize,
    pub nodes_deleted: usize,
    pub cluster_deleted: bool,
}

/// Keeps the stored node inventory and cluster health in line with what
/// the control plane and the metrics backend report.
pub struct NodeReconciler {
    inventory: Arc<dyn WorkloadInventory>,
    metrics: Arc<dyn MetricsQuery>,
    registry: Arc<TargetRegistry>,
    store: Arc<dyn FleetStore>,
    config: ReconcileConfig,
}

impl NodeReconciler {
    pub fn new(
        inventory: Arc<dyn WorkloadInventory>,
        metrics: Arc<dyn MetricsQuery>,
        registry: Arc<TargetRegistry>,
        store: Arc<dyn FleetStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            inventory,
            metrics,
            registry,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    async fn cluster(&self, id: &str) -> Result<ClusterRecord, SyncError> {
        self.store
            .get_cluster(id)
            .await
            .map_err(SyncError::Store)?
            .ok_or_else(|| SyncError::ClusterNotFound(id.to_string()))
    }

    /// One reconciliation pass. A listing failure aborts before any write.
    pub async fn sync_cluster(&self, ctx: &SyncContext, cluster_id: &str) -> Result<SyncReport, SyncError> {
        let span = tracing::info_span!(
            "sync_cluster",
            cluster_id,
            correlation_id = %ctx.correlation_id,
            trigger = ?ctx.trigger,
            full_sync = ctx.full_sync
        );
        self.sync_pass(ctx, cluster_id).instrument(span).await
    }

    async fn sync_pass(&self, ctx: &SyncContext, cluster_id: &str) -> Result<SyncReport, SyncError> {
        let cluster = self.cluster(cluster_id).await?;
        let nodes = self.inventory.list_nodes(&cluster, self.config.list_timeout).await?;

        let mut ips: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.preferred_ip())
            .map(str::to_string)
            .collect();
        ips.sort();
        ips.dedup();

        let mut report = SyncReport {
            cluster_id: cluster.id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            status: ClusterStatus::Unknown,
            total: nodes.len(),
            not_ready: 0,
            with_metrics: 0,
            targets_added: 0,
            targets_ready: None,
            write_failures: 0,
        };

        if ctx.full_sync && !ips.is_empty() {
            report.targets_added = self
                .registry
                .add_targets(&ips, self.config.exporter_port, TargetLabels::for_cluster(&cluster.name))
                .await;
            let readiness = ReadinessConfig {
                port: self.config.exporter_port,
                ..self.config.readiness
            };
            report.targets_ready = Some(wait_ready(self.metrics.as_ref(), &ips, &readiness).await);
        }

        let hardware = self.collect_hardware(&ips).await;
        report.with_metrics = hardware.len();

        let now = now_ms();
        for node in &nodes {
            let specs = node.preferred_ip().and_then(|ip| hardware.get(ip));
            if let Err(e) = self.persist_node(&cluster.id, node, specs, now).await {
                tracing::warn!(node = %node.name, error = format!("{e:#}"), "node write failed, skipping");
                report.write_failures += 1;
            }
        }

        report.not_ready = nodes.iter().filter(|n| !n.k8s_status().is_ready()).count();
        report.status = ClusterStatus::from_node_counts(report.not_ready, report.total);

        let store = &self.store;
        let (id, status) = (cluster.id.as_str(), report.status);
        run_with_retry("set_cluster_status", self.config.write_retry, |_| async move {
            match store.set_cluster_status(id, status).await {
                Ok(()) => TaskOutcome::Done(()),
                Err(e) => TaskOutcome::Retryable(format!("{e:#}")),
            }
        })
        .await
        .map_err(|e| SyncError::Store(anyhow::anyhow!(e)))?;

        tracing::info!(
            cluster = %cluster.name,
            status = %report.status,
            total = report.total,
            not_ready = report.not_ready,
            with_metrics = report.with_metrics,
            "cluster synced"
        );
        Ok(report)
    }

    /// Per-node hardware readings keyed by ip. Instances that time out or
    /// report no CPUs are left out.
    async fn collect_hardware(&self, ips: &[String]) -> HashMap<String, HardwareSpecs> {
        let port = self.config.exporter_port;
        let per_task = self.config.metrics_task_timeout;
        let metrics = self.metrics.as_ref();

        stream::iter(ips.iter().cloned())
            .map(|ip| async move {
                let instance = target_addr(&ip, port);
                match tokio::time::timeout(per_task, fetch_hardware_specs(metrics, &instance)).await {
                    Ok(specs) if specs.is_usable() => Some((ip, specs)),
                    Ok(_) => {
                        tracing::debug!(%instance, "no hardware metrics");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(%instance, timeout_ms = per_task.as_millis() as u64, "hardware query timed out");
                        None
                    }
                }
            })
            .buffer_unordered(self.config.fanout_workers.max(1))
            .filter_map(future::ready)
            .collect()
            .await
    }

    async fn persist_node(
        &self,
        cluster_id: &str,
        node: &NodeInfo,
        specs: Option<&HardwareSpecs>,
        now: u64,
    ) -> Result<(), String> {
        let store = &self.store;
        run_with_retry("upsert_node", self.config.write_retry, |_| async move {
            let existing = match store.get_node(cluster_id, &node.name).await {
                Ok(existing) => existing,
                Err(e) => return TaskOutcome::Retryable(format!("{e:#}")),
            };
            let record = merge_node(existing, cluster_id, node, specs, now);
            match store.upsert_node(&record).await {
                Ok(()) => TaskOutcome::Done(()),
                Err(e) => TaskOutcome::Retryable(format!("{e:#}")),
            }
        })
        .await
    }

    /// Sync under an outer deadline for callers waiting on the result.
    ///
    /// On timeout or an unreachable control plane the cluster is marked
    /// unknown and its stored nodes NotReady before the error is returned.
    pub async fn sync_with_deadline(&self, ctx: &SyncContext, cluster_id: &str) -> Result<SyncReport, SyncError> {
        let budget = ctx
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.sync_deadline);

        match tokio::time::timeout(budget, self.sync_cluster(ctx, cluster_id)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e @ SyncError::Connectivity { .. })) => {
                self.mark_degraded(cluster_id).await;
                Err(e)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let cluster = self.mark_degraded(cluster_id).await;
                Err(SyncError::DeadlineExceeded { cluster, budget })
            }
        }
    }

    /// Cluster to unknown, every stored node to NotReady. Best effort;
    /// returns the cluster's display name.
    async fn mark_degraded(&self, cluster_id: &str) -> String {
        let name = match self.store.get_cluster(cluster_id).await {
            Ok(Some(c)) => c.name,
            _ => cluster_id.to_string(),
        };

        if let Err(e) = self.store.set_cluster_status(cluster_id, ClusterStatus::Unknown).await {
            tracing::warn!(cluster = %name, error = format!("{e:#}"), "failed to mark cluster unknown");
        }

        match self.store.list_nodes(cluster_id).await {
            Ok(nodes) => {
                let now = now_ms();
                for mut node in nodes {
                    node.k8s_status = K8sStatus::NotReady;
                    node.updated_at_ms = now;
                    if let Err(e) = self.store.upsert_node(&node).await {
                        tracing::warn!(node = %node.name, error = format!("{e:#}"), "failed to mark node NotReady");
                    }
                }
            }
            Err(e) => tracing::warn!(cluster = %name, error = format!("{e:#}"), "failed to list nodes"),
        }
        tracing::warn!(cluster = %name, "cluster marked degraded");
        name
    }

    /// Background sync: connectivity and storage failures are retried per
    /// `background_retry`, a missing cluster or bad credential is not.
    pub async fn sync_with_retry(&self, ctx: &SyncContext, cluster_id: &str) -> Result<SyncReport, SyncError> {
        let this = self;
        run_with_retry("sync_cluster", self.config.background_retry, move |_| async move {
            match this.sync_cluster(ctx, cluster_id).await {
                Ok(report) => TaskOutcome::Done(report),
                Err(e) if e.is_retryable() => TaskOutcome::Retryable(e),
                Err(e) => TaskOutcome::Fatal(e),
            }
        })
        .await
    }

    /// First-time registration: deploy the exporter, run a full sync and
    /// record the import outcome on the cluster.
    pub async fn import(&self, ctx: &SyncContext, cluster_id: &str) -> Result<SyncReport, SyncError> {
        let cluster = self.cluster(cluster_id).await?;
        if let Err(e) = self
            .inventory
            .ensure_node_exporter(&cluster, self.config.exporter_port)
            .await
        {
            tracing::warn!(cluster = %cluster.name, error = %e, "node-exporter deployment failed, continuing");
        }

        let ctx = ctx.clone().with_full_sync(true);
        let result = self.sync_with_retry(&ctx, cluster_id).await;

        let status = if result.is_ok() {
            ImportStatus::Success
        } else {
            ImportStatus::Failed
        };
        if let Err(e) = self.store.set_import_status(cluster_id, status).await {
            tracing::warn!(cluster = %cluster.name, error = format!("{e:#}"), "failed to record import status");
        }
        result
    }

    /// Release cached control-plane state of a cluster that is gone.
    pub fn forget_cluster(&self, cluster_id: &str) {
        self.inventory.forget(cluster_id);
    }

    /// Remove a cluster with its nodes and their scrape targets.
    pub async fn decommission(&self, cluster_id: &str) -> Result<DecommissionReport, SyncError> {
        let nodes = self.store.list_nodes(cluster_id).await.map_err(SyncError::Store)?;
        let targets: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.target(self.config.exporter_port))
            .collect();

        let targets_removed = self.registry.remove_targets(&targets).await;
        let nodes_deleted = self.store.delete_nodes(cluster_id).await.map_err(SyncError::Store)?;
        let cluster_deleted = self.store.delete_cluster(cluster_id).await.map_err(SyncError::Store)?;
        self.forget_cluster(cluster_id);

        tracing::info!(cluster_id, targets_removed, nodes_deleted, cluster_deleted, "cluster decommissioned");
        Ok(DecommissionReport {
            cluster_id: cluster_id.to_string(),
            targets_removed,
            nodes_deleted,
            cluster_deleted,
        })
    }
}

/// Apply one listing to the stored record.
///
/// Usable readings overwrite the hardware fields whatever the node status.
/// Without them an existing record keeps its last known hardware and a new
/// one starts from zero values.
fn merge_node(
    existing: Option<NodeRecord>,
    cluster_id: &str,
    node: &NodeInfo,
    specs: Option<&HardwareSpecs>,
    now: u64,
) -> NodeRecord {
    let mut record = existing.unwrap_or_else(|| {
        let mut fresh = NodeRecord {
            cluster_id: cluster_id.to_string(),
            name: node.name.clone(),
            ip: String::new(),
            role: NodeRole::default(),
            k8s_status: K8sStatus::default(),
            cpu_cores: 0,
            memory: String::new(),
            disk_total: String::new(),
            os_image: String::new(),
            updated_at_ms: now,
        };
        fresh.set_hardware(HardwareSpecs::default());
        fresh
    });

    record.ip = node.preferred_ip().unwrap_or_default().to_string();
    record.role = node.role();
    record.k8s_status = node.k8s_status();
    record.os_image = node.os_image.clone();
    if let Some(specs) = specs {
        record.set_hardware(specs.clone());
    }
    record.updated_at_ms = now;
    record
}
