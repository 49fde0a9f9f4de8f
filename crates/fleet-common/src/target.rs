use serde::{Deserialize, Serialize};

/// Label set attached to a group of scrape targets. Cluster imports label
/// by `cluster`, standalone hosts by `region`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetLabels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl TargetLabels {
    pub fn for_cluster(cluster: &str) -> Self {
        Self {
            cluster: Some(cluster.to_string()),
            region: None,
            source: Some("k8s_import".to_string()),
            env: Some("prod".to_string()),
        }
    }

    pub fn for_region(region: &str) -> Self {
        Self {
            cluster: None,
            region: Some(region.to_string()),
            source: None,
            env: Some("prod".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrapeTargetGroup {
    pub targets: Vec<String>,
    pub labels: TargetLabels,
}

/// Where the node exporter was deployed from; decides its listen port.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExporterChannel {
    /// DaemonSet rolled out by cluster import.
    #[default]
    Kubernetes,
    /// systemd unit installed on a standalone host.
    Standalone,
}

impl ExporterChannel {
    pub fn port(&self) -> u16 {
        match self {
            ExporterChannel::Kubernetes => 27684,
            ExporterChannel::Standalone => 27683,
        }
    }
}

pub fn target_addr(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_wire_format() {
        let group = ScrapeTargetGroup {
            targets: vec![target_addr("10.0.0.1", ExporterChannel::Kubernetes.port())],
            labels: TargetLabels::for_cluster("demo"),
        };
        let v = serde_json::to_value(&group).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "targets": ["10.0.0.1:27684"],
                "labels": {"cluster": "demo", "source": "k8s_import", "env": "prod"}
            })
        );
    }

    #[test]
    fn test_region_labels_omit_cluster() {
        let v = serde_json::to_value(TargetLabels::for_region("bj-1")).unwrap();
        assert_eq!(v, serde_json::json!({"region": "bj-1", "env": "prod"}));
        assert_eq!(ExporterChannel::Standalone.port(), 27683);
    }
}
