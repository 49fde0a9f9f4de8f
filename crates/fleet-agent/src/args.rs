use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use fleet_common::ExporterChannel;

#[derive(Debug, Parser)]
#[command(name = "fleet-agent")]
#[command(about = "Kubernetes fleet inventory and health reconciliation", long_about = None)]
pub struct Args {
    #[arg(long, env = "FLEET_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Prometheus base URL for hardware and readiness queries.
    #[arg(long, env = "FLEET_PROMETHEUS_URL", default_value = "http://127.0.0.1:9090")]
    pub prometheus_url: String,

    /// File service discovery list scraped by Prometheus.
    #[arg(
        long,
        env = "FLEET_TARGETS_FILE",
        default_value = "/etc/prometheus/file_sd/node_exporter.json"
    )]
    pub targets_file: PathBuf,

    /// Where node-exporter runs; selects the scrape port.
    #[arg(long, env = "FLEET_EXPORTER_CHANNEL", value_enum, default_value_t = Channel::Kubernetes)]
    pub channel: Channel,

    /// OTLP/HTTP traces endpoint (e.g. "http://127.0.0.1:4318/v1/traces").
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Channel {
    /// DaemonSet deployed by import
    Kubernetes,
    /// Exporter installed directly on the host
    Standalone,
}

impl From<Channel> for ExporterChannel {
    fn from(c: Channel) -> Self {
        match c {
            Channel::Kubernetes => ExporterChannel::Kubernetes,
            Channel::Standalone => ExporterChannel::Standalone,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Probe liveness of every registered cluster
    Probe {
        #[arg(long, default_value_t = 10)]
        workers: usize,
    },
    /// Reconcile one cluster's nodes and health
    Sync {
        cluster_id: String,
        /// Register scrape targets and wait for them before querying
        #[arg(long)]
        full: bool,
        /// Outer budget; on expiry the cluster is marked degraded
        #[arg(long, default_value_t = 7)]
        deadline_secs: u64,
    },
    /// Register a cluster from a kubeconfig file, pending import
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        kubeconfig: PathBuf,
        #[arg(long)]
        description: Option<String>,
    },
    /// Deploy node-exporter and run the first full sync
    Import { cluster_id: String },
    /// Remove a cluster, its nodes and their scrape targets
    Remove { cluster_id: String },
    /// Inspect or edit the scrape target list
    Targets {
        #[command(subcommand)]
        subcommand: TargetsCommand,
    },
    /// Run a range query and print the series
    Range {
        query: String,
        #[arg(long, default_value_t = 60)]
        since_mins: i64,
        #[arg(long, default_value_t = 60)]
        step_secs: u64,
    },
    /// Run the probe, sync and import loops with /metrics and /healthz
    Serve {
        #[arg(long, default_value = "0.0.0.0:9108")]
        listen: SocketAddr,
        #[arg(long, default_value_t = 60)]
        probe_interval_secs: u64,
        #[arg(long, default_value_t = 300)]
        sync_interval_secs: u64,
        #[arg(long, default_value_t = 10)]
        probe_workers: usize,
        /// Clusters synced at the same time by the periodic loop
        #[arg(long, default_value_t = 4)]
        sync_concurrency: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum TargetsCommand {
    /// Print every target group
    List,
    /// Add standalone hosts under a region label
    Add {
        #[arg(long)]
        region: String,
        #[arg(required = true)]
        ips: Vec<String>,
    },
    /// Remove `ip:port` targets
    Remove {
        #[arg(required = true)]
        targets: Vec<String>,
    },
}
