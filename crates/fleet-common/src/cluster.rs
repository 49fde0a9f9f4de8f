use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    #[default]
    Running,
    Abnormal,
    Unknown,
}

impl ClusterStatus {
    /// Cluster health from its node readiness counts. A node counts as not
    /// ready unless its Ready condition is `True`.
    pub fn from_node_counts(not_ready: usize, total: usize) -> Self {
        if total == 0 {
            ClusterStatus::Unknown
        } else if not_ready == 0 {
            ClusterStatus::Running
        } else if not_ready >= total {
            ClusterStatus::Unknown
        } else {
            ClusterStatus::Abnormal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Running => "running",
            ClusterStatus::Abnormal => "abnormal",
            ClusterStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    #[default]
    Success,
    Failed,
    Pending,
}

/// A registered cluster. `credential` is the kubeconfig document used to
/// reach the control plane; it is never logged.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub api_server: Option<String>,
    pub credential: String,

    #[serde(default)]
    pub cluster_status: ClusterStatus,
    #[serde(default)]
    pub import_status: ImportStatus,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl ClusterRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: None,
            api_server: None,
            credential: credential.into(),
            cluster_status: ClusterStatus::Running,
            import_status: ImportStatus::Pending,
            created_at_ms: crate::now_ms(),
        }
    }
}

impl fmt::Debug for ClusterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("api_server", &self.api_server)
            .field("credential", &"<redacted>")
            .field("cluster_status", &self.cluster_status)
            .field("import_status", &self.import_status)
            .finish()
    }
}
