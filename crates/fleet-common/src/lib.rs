pub mod cluster;
pub mod context;
pub mod metric;
pub mod node;
pub mod target;
pub mod telemetry;

pub use cluster::{ClusterRecord, ClusterStatus, ImportStatus};
pub use context::{SyncContext, SyncTrigger};
pub use metric::{MetricSample, Series};
pub use node::{HardwareSpecs, K8sStatus, NodeRecord, NodeRole};
pub use target::{target_addr, ExporterChannel, ScrapeTargetGroup, TargetLabels};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
