use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use dashmap::DashSet;
use futures_util::{stream, StreamExt};
use tokio::time::MissedTickBehavior;

use fleet_common::{ImportStatus, SyncContext, SyncTrigger};
use fleet_engine::{ClusterProber, NodeReconciler, TargetRegistry};
use fleet_store::{ClusterDirectory, ClusterEvent, FleetStore};

use crate::metrics::{healthz_handler, metrics_handler, MetricsState, SharedMetrics};

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub listen: SocketAddr,
    pub probe_interval: Duration,
    pub sync_interval: Duration,
    pub sync_concurrency: usize,
}

pub async fn run(
    reconciler: Arc<NodeReconciler>,
    prober: Arc<ClusterProber>,
    store: Arc<dyn FleetStore>,
    registry: Arc<TargetRegistry>,
    opts: ServeOptions,
) -> anyhow::Result<()> {
    let metrics = Arc::new(SharedMetrics::default());

    tokio::spawn(probe_loop(prober.clone(), metrics.clone(), opts.probe_interval));
    tokio::spawn(sync_loop(
        reconciler.clone(),
        store.clone(),
        metrics.clone(),
        opts.sync_interval,
        opts.sync_concurrency,
    ));
    tokio::spawn(import_loop(reconciler, prober, store, metrics.clone()));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(MetricsState { metrics, registry });

    let listener = tokio::net::TcpListener::bind(opts.listen).await?;
    tracing::info!(listen=%opts.listen, "fleet-agent serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn probe_loop(prober: Arc<ClusterProber>, metrics: Arc<SharedMetrics>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match prober.probe_all().await {
            Ok(summary) => metrics.record_probe(&summary),
            Err(e) => tracing::error!(error=%e, "probe batch failed"),
        }
    }
}

/// Periodic non-full sync of every imported cluster.
async fn sync_loop(
    reconciler: Arc<NodeReconciler>,
    store: Arc<dyn FleetStore>,
    metrics: Arc<SharedMetrics>,
    every: Duration,
    concurrency: usize,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; imports cover fresh clusters
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let clusters = match store.list_clusters().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = format!("{e:#}"), "failed to list clusters for sync");
                continue;
            }
        };
        let ids: Vec<String> = clusters
            .into_iter()
            .filter(|c| c.import_status == ImportStatus::Success)
            .map(|c| c.id)
            .collect();
        tracing::debug!(clusters = ids.len(), "periodic sync");

        let reconciler = reconciler.as_ref();
        let metrics = metrics.as_ref();
        stream::iter(ids)
            .for_each_concurrent(concurrency.max(1), |id| async move {
                let ctx = SyncContext::new(SyncTrigger::Scheduled);
                metrics.sync_passes_total.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = reconciler.sync_with_retry(&ctx, &id).await {
                    metrics.sync_failures_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(cluster_id = %id, error = %e, "periodic sync failed");
                }
            })
            .await;
    }
}

/// Import every cluster that shows up pending, including ones registered
/// while the watch was down.
async fn import_loop(
    reconciler: Arc<NodeReconciler>,
    prober: Arc<ClusterProber>,
    store: Arc<dyn FleetStore>,
    metrics: Arc<SharedMetrics>,
) {
    let in_flight: Arc<DashSet<String>> = Arc::new(DashSet::new());
    let importer = Importer {
        reconciler,
        store,
        metrics,
        in_flight,
    };

    loop {
        match importer.store.list_clusters().await {
            Ok(clusters) => {
                for c in clusters {
                    if c.import_status == ImportStatus::Pending {
                        importer.spawn(c.id);
                    }
                }
            }
            Err(e) => tracing::warn!(error = format!("{e:#}"), "failed to list pending clusters"),
        }

        let mut events = match importer.store.watch_clusters().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = format!("{e:#}"), "failed to watch clusters, retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                ClusterEvent::Put(record) if record.import_status == ImportStatus::Pending => {
                    importer.spawn(record.id);
                }
                ClusterEvent::Put(_) => {}
                ClusterEvent::Deleted(id) => {
                    importer.reconciler.forget_cluster(&id);
                    prober.forget_cluster(&id);
                }
            }
        }

        tracing::warn!("cluster watch ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[derive(Clone)]
struct Importer {
    reconciler: Arc<NodeReconciler>,
    store: Arc<dyn FleetStore>,
    metrics: Arc<SharedMetrics>,
    in_flight: Arc<DashSet<String>>,
}

impl Importer {
    fn spawn(&self, cluster_id: String) {
        if !self.in_flight.insert(cluster_id.clone()) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.import(&cluster_id).await;
            this.in_flight.remove(&cluster_id);
        });
    }

    async fn import(&self, cluster_id: &str) {
        // status writes of a finished import can still be in the watch queue
        match self.store.get_cluster(cluster_id).await {
            Ok(Some(c)) if c.import_status == ImportStatus::Pending => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(cluster_id, error = format!("{e:#}"), "failed to read cluster before import");
                return;
            }
        }

        let ctx = SyncContext::new(SyncTrigger::Import);
        self.metrics.imports_total.fetch_add(1, Ordering::Relaxed);
        match self.reconciler.import(&ctx, cluster_id).await {
            Ok(report) => tracing::info!(
                cluster_id,
                nodes = report.total,
                status = %report.status,
                targets_added = report.targets_added,
                "cluster imported"
            ),
            Err(e) => {
                self.metrics.import_failures_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(cluster_id, error = %e, "cluster import failed");
            }
        }
    }
}
