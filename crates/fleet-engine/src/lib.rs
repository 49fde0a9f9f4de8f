//! Cluster node synchronization and health reconciliation.
//!
//! Two independent entry points share the collaborators below:
//! [`NodeReconciler`] keeps a cluster's node inventory, health and scrape
//! targets in step with its control plane, and [`ClusterProber`] sweeps
//! liveness across every registered cluster.

pub mod control_plane;
pub mod error;
pub mod hardware;
pub mod inventory;
pub mod probe;
pub mod prometheus;
pub mod readiness;
pub mod reconcile;
pub mod registry;
pub mod task;

pub use control_plane::{KubeInventory, KubeTimeouts};
pub use error::{RegistryError, SyncError};
pub use inventory::{NodeAddress, NodeCondition, NodeInfo, WorkloadInventory};
pub use probe::{ClusterProber, ProbeConfig, ProbeSummary};
pub use prometheus::{MetricsQuery, PrometheusClient};
pub use readiness::{wait_ready, ReadinessConfig};
pub use reconcile::{DecommissionReport, NodeReconciler, ReconcileConfig, SyncReport};
pub use registry::TargetRegistry;
pub use task::{run_with_retry, RetryPolicy, TaskOutcome};
