use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use fleet_common::{ClusterRecord, K8sStatus, NodeRole};

use crate::error::SyncError;

const INTERNAL_IP: &str = "InternalIP";
const READY_CONDITION: &str = "Ready";
const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub kind: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCondition {
    pub kind: String,
    pub status: String,
}

/// A node as listed by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
    pub labels: BTreeMap<String, String>,
    pub conditions: Vec<NodeCondition>,
    pub os_image: String,
}

impl NodeInfo {
    /// The internal address if tagged, else the first listed one.
    pub fn preferred_ip(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == INTERNAL_IP)
            .or_else(|| self.addresses.first())
            .map(|a| a.address.as_str())
            .filter(|ip| !ip.is_empty())
    }

    pub fn role(&self) -> NodeRole {
        if CONTROL_PLANE_LABELS
            .iter()
            .any(|l| self.labels.contains_key(*l))
        {
            NodeRole::Master
        } else {
            NodeRole::Worker
        }
    }

    pub fn k8s_status(&self) -> K8sStatus {
        match self.conditions.iter().find(|c| c.kind == READY_CONDITION) {
            Some(c) if c.status == "True" => K8sStatus::Ready,
            Some(_) => K8sStatus::NotReady,
            None => K8sStatus::Unknown,
        }
    }
}

/// Read access to a cluster's control plane.
///
/// Implementations enforce `timeout` as a hard bound on the whole call and
/// never retry internally; failures surface as [`SyncError::Connectivity`]
/// (or [`SyncError::InvalidCredential`] when no connection can be built).
#[async_trait]
pub trait WorkloadInventory: Send + Sync {
    async fn list_nodes(&self, cluster: &ClusterRecord, timeout: Duration) -> Result<Vec<NodeInfo>, SyncError>;

    /// Cheapest possible authenticated round trip.
    async fn probe(&self, cluster: &ClusterRecord, timeout: Duration) -> Result<(), SyncError>;

    /// Make sure the node-exporter DaemonSet listening on `port` is deployed.
    async fn ensure_node_exporter(&self, cluster: &ClusterRecord, port: u16) -> Result<(), SyncError>;

    /// Drop any per-cluster state held for a removed cluster.
    fn forget(&self, _cluster_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(kind: &str, address: &str) -> NodeAddress {
        NodeAddress {
            kind: kind.to_string(),
            address: address.to_string(),
        }
    }

    fn cond(status: &str) -> NodeCondition {
        NodeCondition {
            kind: "Ready".to_string(),
            status: status.to_string(),
        }
    }

    #[test]
    fn test_preferred_ip() {
        let mut node = NodeInfo {
            addresses: vec![addr("Hostname", "worker-1"), addr("InternalIP", "10.0.0.7")],
            ..Default::default()
        };
        assert_eq!(node.preferred_ip(), Some("10.0.0.7"));

        node.addresses = vec![addr("ExternalIP", "1.2.3.4"), addr("Hostname", "worker-1")];
        assert_eq!(node.preferred_ip(), Some("1.2.3.4"));

        node.addresses.clear();
        assert_eq!(node.preferred_ip(), None);
    }

    #[test]
    fn test_role_from_labels() {
        let mut node = NodeInfo::default();
        assert_eq!(node.role(), NodeRole::Worker);
        node.labels
            .insert("node-role.kubernetes.io/master".to_string(), String::new());
        assert_eq!(node.role(), NodeRole::Master);
        node.labels.clear();
        node.labels
            .insert("node-role.kubernetes.io/control-plane".to_string(), "true".to_string());
        assert_eq!(node.role(), NodeRole::Master);
    }

    #[test]
    fn test_status_from_ready_condition() {
        let mut node = NodeInfo::default();
        assert_eq!(node.k8s_status(), K8sStatus::Unknown);

        node.conditions = vec![
            NodeCondition {
                kind: "MemoryPressure".to_string(),
                status: "False".to_string(),
            },
            cond("True"),
        ];
        assert_eq!(node.k8s_status(), K8sStatus::Ready);

        node.conditions = vec![cond("Unknown")];
        assert_eq!(node.k8s_status(), K8sStatus::NotReady);
    }
}
