use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    #[default]
    Worker,
}

/// Node readiness as reported by the control plane's Ready condition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum K8sStatus {
    Ready,
    NotReady,
    #[default]
    Unknown,
}

impl K8sStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, K8sStatus::Ready)
    }
}

/// Hardware readings derived from node-exporter telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareSpecs {
    pub cpu_cores: u32,
    pub memory: String,
    pub disk_total: String,
}

impl Default for HardwareSpecs {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            memory: "0 GiB".to_string(),
            disk_total: "0 GiB".to_string(),
        }
    }
}

impl HardwareSpecs {
    /// Readings are only trusted when the exporter reported at least one CPU.
    pub fn is_usable(&self) -> bool {
        self.cpu_cores > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub cluster_id: String,
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default)]
    pub k8s_status: K8sStatus,

    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub disk_total: String,
    #[serde(default)]
    pub os_image: String,

    #[serde(default)]
    pub updated_at_ms: u64,
}

impl NodeRecord {
    pub fn hardware(&self) -> HardwareSpecs {
        HardwareSpecs {
            cpu_cores: self.cpu_cores,
            memory: self.memory.clone(),
            disk_total: self.disk_total.clone(),
        }
    }

    pub fn set_hardware(&mut self, specs: HardwareSpecs) {
        self.cpu_cores = specs.cpu_cores;
        self.memory = specs.memory;
        self.disk_total = specs.disk_total;
    }

    /// Scrape target for this node's exporter, if the node has an address.
    pub fn target(&self, port: u16) -> Option<String> {
        if self.ip.is_empty() {
            None
        } else {
            Some(crate::target_addr(&self.ip, port))
        }
    }
}
