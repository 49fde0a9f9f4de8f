use std::{collections::BTreeMap, sync::Arc};

use anyhow::{bail, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use fleet_common::{now_ms, ClusterRecord, ClusterStatus, ImportStatus, NodeRecord};

use crate::types::{ClusterDirectory, ClusterEvent, ClusterWatchStream, NodeInventory};

/// Process-local store. Used by tests and single-process deployments.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<ClusterEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    clusters: BTreeMap<String, ClusterRecord>,
    nodes: BTreeMap<(String, String), NodeRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }

    async fn update_cluster(
        &self,
        id: &str,
        apply: impl FnOnce(&mut ClusterRecord),
    ) -> Result<()> {
        let record = {
            let mut inner = self.inner.write().await;
            let Some(record) = inner.clusters.get_mut(id) else {
                bail!("cluster {id} not found");
            };
            apply(record);
            record.clone()
        };
        self.emit(ClusterEvent::Put(record));
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusterDirectory for MemoryStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>> {
        Ok(self.inner.read().await.clusters.get(id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        Ok(self.inner.read().await.clusters.values().cloned().collect())
    }

    async fn put_cluster(&self, record: &ClusterRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .clusters
            .insert(record.id.clone(), record.clone());
        self.emit(ClusterEvent::Put(record.clone()));
        Ok(())
    }

    async fn set_cluster_status(&self, id: &str, status: ClusterStatus) -> Result<()> {
        self.update_cluster(id, |c| c.cluster_status = status).await
    }

    async fn set_import_status(&self, id: &str, status: ImportStatus) -> Result<()> {
        self.update_cluster(id, |c| c.import_status = status).await
    }

    async fn delete_cluster(&self, id: &str) -> Result<bool> {
        let existed = self.inner.write().await.clusters.remove(id).is_some();
        if existed {
            self.emit(ClusterEvent::Deleted(id.to_string()));
        }
        Ok(existed)
    }

    async fn watch_clusters(&self) -> Result<ClusterWatchStream> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|msg| msg.ok());
        Ok(Box::pin(stream))
    }
}

#[async_trait::async_trait]
impl NodeInventory for MemoryStore {
    async fn get_node(&self, cluster_id: &str, name: &str) -> Result<Option<NodeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .get(&(cluster_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn upsert_node(&self, record: &NodeRecord) -> Result<()> {
        let mut record = record.clone();
        record.updated_at_ms = now_ms();
        self.inner
            .write()
            .await
            .nodes
            .insert((record.cluster_id.clone(), record.name.clone()), record);
        Ok(())
    }

    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<NodeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn delete_nodes(&self, cluster_id: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.nodes.len();
        inner.nodes.retain(|(cid, _), _| cid != cluster_id);
        Ok(before - inner.nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cluster_id: &str, name: &str) -> NodeRecord {
        NodeRecord {
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            ip: "10.0.0.1".to_string(),
            role: Default::default(),
            k8s_status: Default::default(),
            cpu_cores: 4,
            memory: "8.00 GiB".to_string(),
            disk_total: "100.00 GiB".to_string(),
            os_image: "Ubuntu 22.04".to_string(),
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_set_status_on_missing_cluster_fails() {
        let store = MemoryStore::new();
        assert!(store
            .set_cluster_status("nope", ClusterStatus::Abnormal)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_nodes_are_scoped_per_cluster() {
        let store = MemoryStore::new();
        store.upsert_node(&node("a", "n1")).await.unwrap();
        store.upsert_node(&node("a", "n2")).await.unwrap();
        store.upsert_node(&node("b", "n1")).await.unwrap();

        assert_eq!(store.list_nodes("a").await.unwrap().len(), 2);
        assert_eq!(store.delete_nodes("a").await.unwrap(), 2);
        assert!(store.get_node("a", "n1").await.unwrap().is_none());
        assert!(store.get_node("b", "n1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_sees_status_updates_and_deletes() {
        let store = MemoryStore::new();
        let mut watch = store.watch_clusters().await.unwrap();

        store
            .put_cluster(&ClusterRecord::new("c1", "demo", "kubeconfig"))
            .await
            .unwrap();
        store
            .set_import_status("c1", ImportStatus::Success)
            .await
            .unwrap();
        store.delete_cluster("c1").await.unwrap();

        match watch.next().await {
            Some(ClusterEvent::Put(c)) => assert_eq!(c.import_status, ImportStatus::Pending),
            other => panic!("unexpected event: {other:?}"),
        }
        match watch.next().await {
            Some(ClusterEvent::Put(c)) => assert_eq!(c.import_status, ImportStatus::Success),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(watch.next().await, Some(ClusterEvent::Deleted("c1".to_string())));
    }
}
