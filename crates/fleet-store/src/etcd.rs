use std::sync::Arc;

use anyhow::{bail, Result};
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use fleet_common::{now_ms, ClusterRecord, ClusterStatus, ImportStatus, NodeRecord};

use crate::types::{ClusterDirectory, ClusterEvent, ClusterWatchStream, NodeInventory};

const CLUSTER_PREFIX: &str = "/clusters/";
const NODE_PREFIX: &str = "/nodes/";

/// Attempts at a compare-and-swap field update before giving up.
const CAS_ATTEMPTS: usize = 5;

fn cluster_key(id: &str) -> String {
    format!("{CLUSTER_PREFIX}{id}")
}

fn node_prefix(cluster_id: &str) -> String {
    format!("{NODE_PREFIX}{cluster_id}/")
}

fn node_key(cluster_id: &str, name: &str) -> String {
    format!("{NODE_PREFIX}{cluster_id}/{name}")
}

/// Cluster directory and node inventory persisted as JSON values in etcd.
#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }

    /// Read-modify-write of one cluster record, guarded by its mod revision
    /// so a concurrent writer is never overwritten.
    async fn update_cluster(&self, id: &str, apply: impl Fn(&mut ClusterRecord)) -> Result<()> {
        let key = cluster_key(id);
        for attempt in 1..=CAS_ATTEMPTS {
            let mut cli = self.client.lock().await;
            let resp = cli.get(key.as_str(), None).await?;
            let Some(kv) = resp.kvs().first() else {
                bail!("cluster {id} not found");
            };
            let revision = kv.mod_revision();
            let mut record: ClusterRecord = serde_json::from_slice(kv.value())?;
            apply(&mut record);

            let cmp = Compare::mod_revision(key.as_str(), CompareOp::Equal, revision);
            let put = TxnOp::put(key.as_str(), serde_json::to_vec(&record)?, None);
            let txn = Txn::new().when([cmp]).and_then([put]);
            if cli.txn(txn).await?.succeeded() {
                return Ok(());
            }
            tracing::debug!(cluster_id = %id, attempt, "cluster record changed underneath, retrying");
        }
        bail!("cluster {id} kept changing during update")
    }
}

#[async_trait::async_trait]
impl ClusterDirectory for EtcdStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(cluster_key(id), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        let mut cli = self.client.lock().await;
        let resp = cli
            .get(CLUSTER_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut out = Vec::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<ClusterRecord>(kv.value()) {
                Ok(c) => out.push(c),
                Err(e) => {
                    let key = String::from_utf8_lossy(kv.key());
                    tracing::warn!(%key, error=%e, "skipping undecodable cluster record");
                }
            }
        }
        Ok(out)
    }

    async fn put_cluster(&self, record: &ClusterRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let mut cli = self.client.lock().await;
        cli.put(cluster_key(&record.id), value, None).await?;
        Ok(())
    }

    async fn set_cluster_status(&self, id: &str, status: ClusterStatus) -> Result<()> {
        self.update_cluster(id, |c| c.cluster_status = status).await
    }

    async fn set_import_status(&self, id: &str, status: ImportStatus) -> Result<()> {
        self.update_cluster(id, |c| c.import_status = status).await
    }

    async fn delete_cluster(&self, id: &str) -> Result<bool> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(cluster_key(id), None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn watch_clusters(&self) -> Result<ClusterWatchStream> {
        let mut cli = self.client.lock().await;
        let opts = WatchOptions::new().with_prefix();
        let (watcher, mut stream) = cli.watch(CLUSTER_PREFIX, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<ClusterEvent>(256);
        tokio::spawn(async move {
            let _watcher = watcher;
            while let Some(item) = stream.message().await.transpose() {
                let resp = match item {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error=%e, "cluster watch stream failed");
                        return;
                    }
                };

                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let event = match ev.event_type() {
                        EventType::Put => match serde_json::from_slice(kv.value()) {
                            Ok(record) => ClusterEvent::Put(record),
                            Err(e) => {
                                tracing::warn!(error=%e, "skipping undecodable cluster event");
                                continue;
                            }
                        },
                        EventType::Delete => {
                            let key = String::from_utf8_lossy(kv.key());
                            let id = key.strip_prefix(CLUSTER_PREFIX).unwrap_or(&key);
                            ClusterEvent::Deleted(id.to_string())
                        }
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait::async_trait]
impl NodeInventory for EtcdStore {
    async fn get_node(&self, cluster_id: &str, name: &str) -> Result<Option<NodeRecord>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(node_key(cluster_id, name), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    async fn upsert_node(&self, record: &NodeRecord) -> Result<()> {
        let mut record = record.clone();
        record.updated_at_ms = now_ms();
        let value = serde_json::to_vec(&record)?;
        let mut cli = self.client.lock().await;
        cli.put(node_key(&record.cluster_id, &record.name), value, None)
            .await?;
        Ok(())
    }

    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<NodeRecord>> {
        let mut cli = self.client.lock().await;
        let resp = cli
            .get(node_prefix(cluster_id), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut out = Vec::new();
        for kv in resp.kvs() {
            out.push(serde_json::from_slice(kv.value())?);
        }
        Ok(out)
    }

    async fn delete_nodes(&self, cluster_id: &str) -> Result<usize> {
        let mut cli = self.client.lock().await;
        let resp = cli
            .delete(node_prefix(cluster_id), Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(resp.deleted() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_prefix_does_not_overlap_sibling_clusters() {
        assert!(!node_key("ab", "n1").starts_with(&node_prefix("a")));
        assert!(node_key("a", "n1").starts_with(&node_prefix("a")));
        assert_eq!(cluster_key("c1"), "/clusters/c1");
    }
}
