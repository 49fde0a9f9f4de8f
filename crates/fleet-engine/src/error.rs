use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Control plane unreachable or timed out.
    #[error("cluster {cluster} unreachable: {reason}")]
    Connectivity { cluster: String, reason: String },

    #[error("invalid credential for cluster {cluster}: {reason}")]
    InvalidCredential { cluster: String, reason: String },

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("sync of cluster {cluster} exceeded its {budget:?} budget")]
    DeadlineExceeded { cluster: String, budget: Duration },

    #[error("inventory store: {0:#}")]
    Store(anyhow::Error),
}

impl SyncError {
    pub fn connectivity(cluster: &str, reason: impl ToString) -> Self {
        SyncError::Connectivity {
            cluster: cluster.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether a later attempt of the same pass could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity { .. } | SyncError::DeadlineExceeded { .. } | SyncError::Store(_)
        )
    }

    /// Single-line message for a caller waiting on a synchronous sync.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Connectivity { cluster, .. } => {
                format!("Sync failed: cluster {cluster} is unreachable, its nodes were marked NotReady")
            }
            SyncError::DeadlineExceeded { cluster, budget } => format!(
                "Sync failed: cluster {cluster} did not respond within {}s",
                budget.as_secs()
            ),
            SyncError::InvalidCredential { cluster, .. } => {
                format!("Sync failed: the stored kubeconfig for cluster {cluster} is invalid")
            }
            SyncError::ClusterNotFound(id) => format!("Sync failed: cluster {id} does not exist"),
            SyncError::Store(_) => "Sync failed: the inventory store is unavailable".to_string(),
        }
    }
}

/// Failure reading or writing the scrape target file. Always absorbed by
/// the registry's public operations; surfaced only by `load`.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("scrape target file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scrape target file {path} is not a valid target list: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode scrape targets: {0}")]
    Encode(#[from] serde_json::Error),
}
