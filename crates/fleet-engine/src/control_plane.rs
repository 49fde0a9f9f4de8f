use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HostPathVolumeSource, Namespace, Node, PodSpec, PodTemplateSpec,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use fleet_common::ClusterRecord;

use crate::error::SyncError;
use crate::inventory::{NodeAddress, NodeCondition, NodeInfo, WorkloadInventory};

const EXPORTER_NAMESPACE: &str = "cmdb";
const EXPORTER_NAME: &str = "node-exporter";
const EXPORTER_IMAGE: &str = "quay.io/prometheus/node-exporter:v1.8.1";

/// Per-connection socket timeouts. Every call is additionally bounded by
/// the caller's overall timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KubeTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl KubeTimeouts {
    /// Node listing during reconciliation.
    pub const fn sync() -> Self {
        Self {
            connect: Duration::from_secs(3),
            read: Duration::from_secs(5),
        }
    }

    /// Liveness probing, about 5s end to end.
    pub const fn probe() -> Self {
        Self {
            connect: Duration::from_secs(2),
            read: Duration::from_secs(3),
        }
    }

    pub fn total(&self) -> Duration {
        self.connect + self.read
    }
}

impl Default for KubeTimeouts {
    fn default() -> Self {
        Self::sync()
    }
}

/// How a connection proves liveness. Restricted credentials may not list
/// namespaces; those fall back to the version endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeFlavor {
    NamespaceList,
    ServerVersion,
}

struct Connection {
    fingerprint: u64,
    client: Client,
    probe_flavor: OnceLock<ProbeFlavor>,
}

/// [`WorkloadInventory`] backed by the Kubernetes API.
///
/// Connections are cached per cluster id and rebuilt when the stored
/// kubeconfig changes.
pub struct KubeInventory {
    timeouts: KubeTimeouts,
    connections: DashMap<String, Arc<Connection>>,
}

impl KubeInventory {
    pub fn new(timeouts: KubeTimeouts) -> Self {
        Self {
            timeouts,
            connections: DashMap::new(),
        }
    }

    async fn connection(&self, cluster: &ClusterRecord) -> Result<Arc<Connection>, SyncError> {
        let fingerprint = credential_fingerprint(&cluster.credential);
        let cached = self
            .connections
            .get(&cluster.id)
            .map(|c| Arc::clone(c.value()));
        if let Some(conn) = cached.filter(|c| c.fingerprint == fingerprint) {
            return Ok(conn);
        }

        let client = build_client(cluster, self.timeouts).await?;
        let conn = Arc::new(Connection {
            fingerprint,
            client,
            probe_flavor: OnceLock::new(),
        });
        self.connections.insert(cluster.id.clone(), Arc::clone(&conn));
        tracing::debug!(cluster=%cluster.name, "built control plane connection");
        Ok(conn)
    }

    async fn negotiate_probe(
        &self,
        cluster: &ClusterRecord,
        conn: &Connection,
        timeout: Duration,
    ) -> Result<ProbeFlavor, SyncError> {
        let namespaces: Api<Namespace> = Api::all(conn.client.clone());
        match tokio::time::timeout(timeout, namespaces.list(&ListParams::default().limit(1))).await {
            Ok(Ok(_)) => Ok(ProbeFlavor::NamespaceList),
            Ok(Err(kube::Error::Api(resp))) if resp.code == 403 => {
                bounded(cluster, timeout, conn.client.apiserver_version()).await?;
                tracing::info!(cluster=%cluster.name, "namespace listing forbidden, probing via server version");
                Ok(ProbeFlavor::ServerVersion)
            }
            Ok(Err(e)) => Err(SyncError::connectivity(&cluster.name, e)),
            Err(_) => Err(timed_out(cluster, timeout)),
        }
    }
}

#[async_trait]
impl WorkloadInventory for KubeInventory {
    async fn list_nodes(&self, cluster: &ClusterRecord, timeout: Duration) -> Result<Vec<NodeInfo>, SyncError> {
        let conn = self.connection(cluster).await?;
        let nodes: Api<Node> = Api::all(conn.client.clone());
        let list = bounded(cluster, timeout, nodes.list(&ListParams::default())).await?;
        Ok(list.items.into_iter().map(node_info).collect())
    }

    async fn probe(&self, cluster: &ClusterRecord, timeout: Duration) -> Result<(), SyncError> {
        let conn = self.connection(cluster).await?;
        match conn.probe_flavor.get() {
            Some(ProbeFlavor::NamespaceList) => {
                let namespaces: Api<Namespace> = Api::all(conn.client.clone());
                bounded(cluster, timeout, namespaces.list(&ListParams::default().limit(1))).await?;
            }
            Some(ProbeFlavor::ServerVersion) => {
                bounded(cluster, timeout, conn.client.apiserver_version()).await?;
            }
            None => {
                // negotiation itself is a successful round trip
                let flavor = self.negotiate_probe(cluster, &conn, timeout).await?;
                let _ = conn.probe_flavor.set(flavor);
            }
        }
        Ok(())
    }

    async fn ensure_node_exporter(&self, cluster: &ClusterRecord, port: u16) -> Result<(), SyncError> {
        let conn = self.connection(cluster).await?;
        let timeout = self.timeouts.total();

        let namespaces: Api<Namespace> = Api::all(conn.client.clone());
        if bounded(cluster, timeout, namespaces.get_opt(EXPORTER_NAMESPACE))
            .await?
            .is_none()
        {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(EXPORTER_NAMESPACE.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match tokio::time::timeout(timeout, namespaces.create(&PostParams::default(), &ns)).await {
                Ok(Ok(_)) => tracing::info!(cluster=%cluster.name, namespace=EXPORTER_NAMESPACE, "created namespace"),
                Ok(Err(kube::Error::Api(resp))) if resp.code == 409 => {}
                Ok(Err(e)) => return Err(SyncError::connectivity(&cluster.name, e)),
                Err(_) => return Err(timed_out(cluster, timeout)),
            }
        }

        let daemonsets: Api<DaemonSet> = Api::namespaced(conn.client.clone(), EXPORTER_NAMESPACE);
        if bounded(cluster, timeout, daemonsets.get_opt(EXPORTER_NAME))
            .await?
            .is_some()
        {
            tracing::debug!(cluster=%cluster.name, "node-exporter already deployed");
            return Ok(());
        }

        let ds = exporter_daemonset(port);
        match tokio::time::timeout(timeout, daemonsets.create(&PostParams::default(), &ds)).await {
            Ok(Ok(_)) => {
                tracing::info!(cluster=%cluster.name, port, "deployed node-exporter daemonset");
                Ok(())
            }
            Ok(Err(kube::Error::Api(resp))) if resp.code == 409 => Ok(()),
            Ok(Err(e)) => Err(SyncError::connectivity(&cluster.name, e)),
            Err(_) => Err(timed_out(cluster, timeout)),
        }
    }

    fn forget(&self, cluster_id: &str) {
        if self.connections.remove(cluster_id).is_some() {
            tracing::debug!(cluster_id, "dropped cached control-plane connection");
        }
    }
}

async fn build_client(cluster: &ClusterRecord, timeouts: KubeTimeouts) -> Result<Client, SyncError> {
    let invalid = |e: &dyn std::fmt::Display| SyncError::InvalidCredential {
        cluster: cluster.name.clone(),
        reason: e.to_string(),
    };

    let kubeconfig = Kubeconfig::from_yaml(&cluster.credential).map_err(|e| invalid(&e))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| invalid(&e))?;
    config.connect_timeout = Some(timeouts.connect);
    config.read_timeout = Some(timeouts.read);

    Client::try_from(config).map_err(|e| invalid(&e))
}

async fn bounded<T, F>(cluster: &ClusterRecord, timeout: Duration, call: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SyncError::connectivity(&cluster.name, e)),
        Err(_) => Err(timed_out(cluster, timeout)),
    }
}

fn timed_out(cluster: &ClusterRecord, timeout: Duration) -> SyncError {
    SyncError::connectivity(&cluster.name, format!("no response within {timeout:?}"))
}

fn credential_fingerprint(credential: &str) -> u64 {
    let mut h = DefaultHasher::new();
    credential.hash(&mut h);
    h.finish()
}

fn node_info(node: Node) -> NodeInfo {
    let status = node.status.unwrap_or_default();
    NodeInfo {
        name: node.metadata.name.unwrap_or_default(),
        addresses: status
            .addresses
            .unwrap_or_default()
            .into_iter()
            .map(|a| NodeAddress {
                kind: a.type_,
                address: a.address,
            })
            .collect(),
        labels: node.metadata.labels.unwrap_or_default(),
        conditions: status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .map(|c| NodeCondition {
                kind: c.type_,
                status: c.status,
            })
            .collect(),
        os_image: status.node_info.map(|i| i.os_image).unwrap_or_default(),
    }
}

fn exporter_daemonset(port: u16) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_string(), EXPORTER_NAME.to_string())]);
    let port = i32::from(port);

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(EXPORTER_NAME.to_string()),
            namespace: Some(EXPORTER_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    host_pid: Some(true),
                    containers: vec![Container {
                        name: EXPORTER_NAME.to_string(),
                        image: Some(EXPORTER_IMAGE.to_string()),
                        args: Some(vec![
                            "--path.rootfs=/host".to_string(),
                            format!("--web.listen-address=:{port}"),
                            "--collector.tcpstat".to_string(),
                        ]),
                        ports: Some(vec![ContainerPort {
                            container_port: port,
                            host_port: Some(port),
                            name: Some("metrics".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "root".to_string(),
                            mount_path: "/host".to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "root".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        NodeAddress as K8sAddress, NodeCondition as K8sCondition, NodeStatus, NodeSystemInfo,
    };

    use fleet_common::{K8sStatus, NodeRole};

    use super::*;

    #[test]
    fn test_node_info_from_api_object() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("cp-1".to_string()),
                labels: Some(BTreeMap::from([(
                    "node-role.kubernetes.io/control-plane".to_string(),
                    String::new(),
                )])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    K8sAddress {
                        type_: "Hostname".to_string(),
                        address: "cp-1".to_string(),
                    },
                    K8sAddress {
                        type_: "InternalIP".to_string(),
                        address: "192.168.1.10".to_string(),
                    },
                ]),
                conditions: Some(vec![K8sCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                }]),
                node_info: Some(NodeSystemInfo {
                    os_image: "Ubuntu 22.04.4 LTS".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = node_info(node);
        assert_eq!(info.name, "cp-1");
        assert_eq!(info.preferred_ip(), Some("192.168.1.10"));
        assert_eq!(info.role(), NodeRole::Master);
        assert_eq!(info.k8s_status(), K8sStatus::NotReady);
        assert_eq!(info.os_image, "Ubuntu 22.04.4 LTS");
    }

    #[test]
    fn test_node_without_status_is_unknown() {
        let info = node_info(Node::default());
        assert_eq!(info.k8s_status(), K8sStatus::Unknown);
        assert_eq!(info.preferred_ip(), None);
        assert!(info.os_image.is_empty());
    }

    #[test]
    fn test_exporter_daemonset_listens_on_port() {
        let ds = exporter_daemonset(27684);
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        let container = &pod.containers[0];
        assert!(container
            .args
            .as_ref()
            .unwrap()
            .contains(&"--web.listen-address=:27684".to_string()));
        assert_eq!(container.ports.as_ref().unwrap()[0].host_port, Some(27684));
    }

    #[test]
    fn test_fingerprint_tracks_credential_changes() {
        assert_eq!(credential_fingerprint("a"), credential_fingerprint("a"));
        assert_ne!(credential_fingerprint("a"), credential_fingerprint("b"));
    }

    #[tokio::test]
    async fn test_garbage_kubeconfig_is_invalid_credential() {
        let inventory = KubeInventory::new(KubeTimeouts::probe());
        let cluster = ClusterRecord::new("c1", "broken", "::: not yaml :::");
        let err = inventory
            .probe(&cluster, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidCredential { .. }), "{err:?}");
    }
}
