//! Hardware readings derived from node-exporter series.

use fleet_common::{HardwareSpecs, MetricSample};

use crate::prometheus::MetricsQuery;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const FS_TYPES: &str = "ext4|xfs|xfs_quota";
const RUNTIME_MOUNTS: &[&str] = &["/docker", "/kubelet", "/overlay"];

pub fn cpu_query(instance: &str) -> String {
    format!(r#"count(count(node_cpu_seconds_total{{instance="{instance}"}}) by (cpu))"#)
}

pub fn memory_query(instance: &str) -> String {
    format!(r#"node_memory_MemTotal_bytes{{instance="{instance}"}}"#)
}

pub fn disk_query(instance: &str) -> String {
    format!(r#"node_filesystem_size_bytes{{instance="{instance}", fstype=~"{FS_TYPES}"}}"#)
}

/// Query all three readings for one `ip:port` instance. Missing series
/// produce zero values, never an error.
pub async fn fetch_hardware_specs(metrics: &dyn MetricsQuery, instance: &str) -> HardwareSpecs {
    let (cpu_q, mem_q, disk_q) = (cpu_query(instance), memory_query(instance), disk_query(instance));
    let (cpu, mem, disk) = tokio::join!(
        metrics.instant_query(&cpu_q),
        metrics.instant_query(&mem_q),
        metrics.instant_query(&disk_q),
    );

    HardwareSpecs {
        cpu_cores: cpu.first().map(|s| s.value.max(0.0) as u32).unwrap_or(0),
        memory: format_memory(mem.first().map(|s| s.value)),
        disk_total: format_disk(&disk),
    }
}

pub fn format_memory(bytes: Option<f64>) -> String {
    match bytes {
        Some(b) if b > 0.0 => format!("{:.2} GiB", b / GIB),
        _ => "0 GiB".to_string(),
    }
}

/// Sum filesystems outside container runtime mounts; TiB above 1024 GiB.
pub fn format_disk(samples: &[MetricSample]) -> String {
    let bytes: f64 = samples
        .iter()
        .filter(|s| {
            let mountpoint = s.label("mountpoint").unwrap_or_default();
            !RUNTIME_MOUNTS.iter().any(|m| mountpoint.contains(m))
        })
        .map(|s| s.value)
        .sum();

    if bytes <= 0.0 {
        return "0 GiB".to_string();
    }
    format_gib(bytes / GIB)
}

pub fn format_gib(gib: f64) -> String {
    if gib > 1024.0 {
        format!("{:.2} TiB", gib / 1024.0)
    } else {
        format!("{:.2} GiB", gib)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use fleet_common::Series;

    use super::*;

    fn fs(mountpoint: &str, bytes: f64) -> MetricSample {
        MetricSample {
            labels: BTreeMap::from([("mountpoint".to_string(), mountpoint.to_string())]),
            timestamp: 0.0,
            value: bytes,
        }
    }

    #[test]
    fn test_memory_format() {
        assert_eq!(format_memory(Some(17179869184.0)), "16.00 GiB");
        assert_eq!(format_memory(Some(0.0)), "0 GiB");
        assert_eq!(format_memory(None), "0 GiB");
    }

    #[test]
    fn test_gib_to_tib_threshold() {
        assert_eq!(format_gib(2048.0), "2.00 TiB");
        assert_eq!(format_gib(512.0), "512.00 GiB");
        assert_eq!(format_gib(1024.0), "1024.00 GiB");
    }

    #[test]
    fn test_disk_excludes_runtime_mounts() {
        let samples = vec![
            fs("/", 100.0 * GIB),
            fs("/data", 412.0 * GIB),
            fs("/var/lib/docker/overlay2/abc/merged", 100.0 * GIB),
            fs("/var/lib/kubelet/pods/x/volumes", 50.0 * GIB),
            fs("/run/containerd/overlay/snap", 10.0 * GIB),
        ];
        assert_eq!(format_disk(&samples), "512.00 GiB");
        assert_eq!(format_disk(&[]), "0 GiB");
    }

    #[test]
    fn test_queries_scope_instance() {
        assert_eq!(
            cpu_query("10.0.0.1:27684"),
            r#"count(count(node_cpu_seconds_total{instance="10.0.0.1:27684"}) by (cpu))"#
        );
        assert!(disk_query("h:1").contains(r#"fstype=~"ext4|xfs|xfs_quota""#));
    }

    struct Canned {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricsQuery for Canned {
        async fn instant_query(&self, promql: &str) -> Vec<MetricSample> {
            self.seen.lock().unwrap().push(promql.to_string());
            if promql.starts_with("count(") {
                vec![fs("", 8.0)]
            } else if promql.starts_with("node_memory") {
                vec![fs("", 32.0 * GIB)]
            } else {
                vec![fs("/", 2048.0 * GIB), fs("/var/lib/docker", 10.0 * GIB)]
            }
        }

        async fn range_query(&self, _: &str, _: f64, _: f64, _: Duration) -> Vec<Series> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_fetch_hardware_specs() {
        let metrics = Canned { seen: Mutex::new(Vec::new()) };
        let specs = fetch_hardware_specs(&metrics, "10.0.0.1:27684").await;
        assert_eq!(specs.cpu_cores, 8);
        assert_eq!(specs.memory, "32.00 GiB");
        assert_eq!(specs.disk_total, "2.00 TiB");
        assert_eq!(metrics.seen.lock().unwrap().len(), 3);
    }
}
