mod args;
mod metrics;
mod output;
mod serve;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use fleet_common::telemetry::{init_tracing, OtlpConfig};
use fleet_common::{ClusterRecord, ExporterChannel, SyncContext, SyncTrigger, TargetLabels};
use fleet_engine::{
    ClusterProber, KubeInventory, KubeTimeouts, MetricsQuery, NodeReconciler, ProbeConfig, PrometheusClient,
    ReconcileConfig, SyncError, TargetRegistry,
};
use fleet_store::{ClusterDirectory, EtcdStore, FleetStore};

use crate::args::{Args, Command, TargetsCommand};
use crate::output::{print_decommission, print_probe_summary, print_series, print_sync_report, print_target_groups};
use crate::serve::ServeOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let otlp = args.otlp_endpoint.clone().map(|endpoint| OtlpConfig {
        endpoint,
        token: args.otlp_token.clone(),
    });
    let tracer = init_tracing("fleet-agent", otlp.as_ref());

    let result = run(args).await;

    if let Some(provider) = tracer {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    result
}

async fn run(args: Args) -> Result<()> {
    let port = ExporterChannel::from(args.channel).port();

    match args.command {
        Command::Probe { workers } => {
            let store = connect_store(&args.etcd_endpoint).await?;
            let prober = build_prober(store, workers);
            let summary = prober.probe_all().await?;
            print_probe_summary(&summary);
        }
        Command::Sync {
            ref cluster_id,
            full,
            deadline_secs,
        } => {
            let store = connect_store(&args.etcd_endpoint).await?;
            let reconciler = build_reconciler(&args, store, registry(&args))?;
            let result = if full {
                let ctx = SyncContext::new(SyncTrigger::Manual).with_full_sync(true);
                reconciler.sync_cluster(&ctx, cluster_id).await
            } else {
                let ctx = SyncContext::new(SyncTrigger::Manual).with_deadline_ms(deadline_secs * 1000);
                reconciler.sync_with_deadline(&ctx, cluster_id).await
            };
            let report = result.map_err(user_facing)?;
            print_sync_report(&report);
        }
        Command::Register {
            ref id,
            ref name,
            ref kubeconfig,
            ref description,
        } => {
            let credential = tokio::fs::read_to_string(kubeconfig)
                .await
                .with_context(|| format!("read kubeconfig {}", kubeconfig.display()))?;
            let store = connect_store(&args.etcd_endpoint).await?;
            if store.get_cluster(id).await?.is_some() {
                anyhow::bail!("cluster '{id}' is already registered");
            }
            let mut record = ClusterRecord::new(id.as_str(), name.as_str(), credential);
            record.description = description.clone();
            store.put_cluster(&record).await?;
            println!("✓ Cluster '{name}' registered as '{id}', pending import");
        }
        Command::Import { ref cluster_id } => {
            let store = connect_store(&args.etcd_endpoint).await?;
            let reconciler = build_reconciler(&args, store, registry(&args))?;
            let ctx = SyncContext::new(SyncTrigger::Import);
            let report = reconciler.import(&ctx, cluster_id).await.map_err(user_facing)?;
            print_sync_report(&report);
        }
        Command::Remove { ref cluster_id } => {
            let store = connect_store(&args.etcd_endpoint).await?;
            let reconciler = build_reconciler(&args, store, registry(&args))?;
            let report = reconciler.decommission(cluster_id).await?;
            print_decommission(&report);
        }
        Command::Targets { ref subcommand } => {
            let registry = registry(&args);
            match subcommand {
                TargetsCommand::List => {
                    let groups = registry.load().await?;
                    print_target_groups(&groups);
                }
                TargetsCommand::Add { region, ips } => {
                    let added = registry
                        .add_targets(ips, port, TargetLabels::for_region(region))
                        .await;
                    println!("✓ {added} target(s) added under region '{region}'");
                }
                TargetsCommand::Remove { targets } => {
                    let removed = registry.remove_targets(targets).await;
                    println!("✓ {removed} target(s) removed");
                }
            }
        }
        Command::Range {
            ref query,
            since_mins,
            step_secs,
        } => {
            let client = PrometheusClient::new(args.prometheus_url.as_str(), Duration::from_secs(30))?;
            let end = chrono::Utc::now().timestamp();
            let start = end - since_mins * 60;
            let series = client
                .range_query(query, start as f64, end as f64, Duration::from_secs(step_secs))
                .await;
            print_series(&series);
        }
        Command::Serve {
            listen,
            probe_interval_secs,
            sync_interval_secs,
            probe_workers,
            sync_concurrency,
        } => {
            let store = connect_store(&args.etcd_endpoint).await?;
            let registry = registry(&args);
            let reconciler = Arc::new(build_reconciler(&args, store.clone(), registry.clone())?);
            let prober = Arc::new(build_prober(store.clone(), probe_workers));
            let opts = ServeOptions {
                listen,
                probe_interval: Duration::from_secs(probe_interval_secs.max(1)),
                sync_interval: Duration::from_secs(sync_interval_secs.max(1)),
                sync_concurrency,
            };
            serve::run(reconciler, prober, store, registry, opts).await?;
        }
    }
    Ok(())
}

async fn connect_store(endpoint: &str) -> Result<Arc<dyn FleetStore>> {
    let store = EtcdStore::connect(&[endpoint.to_string()])
        .await
        .with_context(|| format!("connect to etcd at {endpoint}"))?;
    tracing::info!(endpoint, "connected to etcd");
    Ok(Arc::new(store))
}

fn registry(args: &Args) -> Arc<TargetRegistry> {
    Arc::new(TargetRegistry::new(args.targets_file.clone()))
}

fn build_reconciler(args: &Args, store: Arc<dyn FleetStore>, registry: Arc<TargetRegistry>) -> Result<NodeReconciler> {
    let metrics = PrometheusClient::new(args.prometheus_url.as_str(), Duration::from_secs(5))
        .context("build prometheus client")?;
    let config = ReconcileConfig {
        exporter_port: ExporterChannel::from(args.channel).port(),
        ..ReconcileConfig::default()
    };
    Ok(NodeReconciler::new(
        Arc::new(KubeInventory::new(KubeTimeouts::sync())),
        Arc::new(metrics),
        registry,
        store,
        config,
    ))
}

fn build_prober(store: Arc<dyn FleetStore>, workers: usize) -> ClusterProber {
    let config = ProbeConfig {
        workers,
        ..ProbeConfig::default()
    };
    ClusterProber::new(Arc::new(KubeInventory::new(KubeTimeouts::probe())), store, config)
}

/// Log the full error, surface the one-line message.
fn user_facing(e: SyncError) -> anyhow::Error {
    tracing::error!(error = %e, "sync failed");
    anyhow::anyhow!(e.user_message())
}
