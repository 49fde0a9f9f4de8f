use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;

use fleet_common::{ClusterRecord, ClusterStatus, ImportStatus, NodeRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Put(ClusterRecord),
    Deleted(String),
}

pub type ClusterWatchStream = Pin<Box<dyn Stream<Item = ClusterEvent> + Send>>;

/// Registered clusters. Owned by the surrounding application; the engine
/// only reads records and writes `cluster_status` / `import_status`.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>>;
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>>;
    async fn put_cluster(&self, record: &ClusterRecord) -> Result<()>;
    async fn set_cluster_status(&self, id: &str, status: ClusterStatus) -> Result<()>;
    async fn set_import_status(&self, id: &str, status: ImportStatus) -> Result<()>;
    /// Returns whether a record existed.
    async fn delete_cluster(&self, id: &str) -> Result<bool>;
    async fn watch_clusters(&self) -> Result<ClusterWatchStream>;
}

/// Per-cluster node inventory keyed by `(cluster_id, name)`.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn get_node(&self, cluster_id: &str, name: &str) -> Result<Option<NodeRecord>>;
    async fn upsert_node(&self, record: &NodeRecord) -> Result<()>;
    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<NodeRecord>>;
    /// Returns the number of records removed.
    async fn delete_nodes(&self, cluster_id: &str) -> Result<usize>;
}

pub trait FleetStore: ClusterDirectory + NodeInventory {}

impl<T: ClusterDirectory + NodeInventory> FleetStore for T {}
