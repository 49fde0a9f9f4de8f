use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{sleep_until, timeout_at, Instant};

use fleet_common::target_addr;

use crate::prometheus::MetricsQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub port: u16,
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            port: 27684,
            max_retries: 10,
            interval: Duration::from_secs(3),
        }
    }
}

/// Poll `up` for every ip until all report 1 in the same round.
///
/// Best effort: `false` after `max_retries` rounds. A round, queries plus
/// the pause before the next one, takes at most `interval`; queries still
/// pending at that point count as not ready. Never sleeps after a
/// successful or final round.
pub async fn wait_ready(metrics: &dyn MetricsQuery, ips: &[String], cfg: &ReadinessConfig) -> bool {
    if ips.is_empty() {
        return true;
    }
    let queries: Vec<String> = ips
        .iter()
        .map(|ip| format!(r#"up{{instance="{}"}}"#, target_addr(ip, cfg.port)))
        .collect();

    let rounds = cfg.max_retries.max(1);
    for round in 1..=rounds {
        let deadline = Instant::now() + cfg.interval;
        let ready = match timeout_at(deadline, join_all(queries.iter().map(|q| metrics.instant_query(q)))).await {
            Ok(results) => results
                .iter()
                .filter(|samples| samples.iter().any(|s| s.value == 1.0))
                .count(),
            Err(_) => {
                tracing::debug!(round, "readiness queries timed out");
                0
            }
        };

        if ready == ips.len() {
            tracing::info!(targets = ips.len(), round, "scrape targets ready");
            return true;
        }
        tracing::debug!(ready, total = ips.len(), round, "waiting for scrape targets");
        if round < rounds {
            sleep_until(deadline).await;
        }
    }

    tracing::warn!(targets = ips.len(), rounds, "scrape targets not ready, continuing");
    false
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use fleet_common::{MetricSample, Series};

    use super::*;

    /// Instances in `up` report 1 from round `ready_from` on.
    struct UpAfter {
        up: HashSet<String>,
        ready_from: u32,
        queries: AtomicU32,
        per_round: u32,
        /// Added to every query.
        latency: Duration,
    }

    #[async_trait]
    impl MetricsQuery for UpAfter {
        async fn instant_query(&self, promql: &str) -> Vec<MetricSample> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let round = n / self.per_round + 1;
            let live = self.up.iter().any(|i| promql.contains(i.as_str())) && round >= self.ready_from;
            vec![MetricSample {
                labels: BTreeMap::new(),
                timestamp: 0.0,
                value: if live { 1.0 } else { 0.0 },
            }]
        }

        async fn range_query(&self, _: &str, _: f64, _: f64, _: Duration) -> Vec<Series> {
            Vec::new()
        }
    }

    fn up_after(instances: &[&str], ready_from: u32, per_round: u32) -> UpAfter {
        UpAfter {
            up: instances.iter().map(|s| s.to_string()).collect(),
            ready_from,
            queries: AtomicU32::new(0),
            per_round,
            latency: Duration::ZERO,
        }
    }

    fn ips() -> Vec<String> {
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_first_round_does_not_sleep() {
        let metrics = up_after(&["10.0.0.1:27684", "10.0.0.2:27684"], 1, 2);
        let start = tokio::time::Instant::now();
        assert!(wait_ready(&metrics, &ips(), &ReadinessConfig::default()).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(metrics.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_third_round() {
        let metrics = up_after(&["10.0.0.1:27684", "10.0.0.2:27684"], 3, 2);
        let start = tokio::time::Instant::now();
        assert!(wait_ready(&metrics, &ips(), &ReadinessConfig::default()).await);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_false() {
        let metrics = up_after(&["10.0.0.1:27684"], 1, 2);
        let start = tokio::time::Instant::now();
        assert!(!wait_ready(&metrics, &ips(), &ReadinessConfig::default()).await);
        assert_eq!(metrics.queries.load(Ordering::SeqCst), 20);
        assert_eq!(start.elapsed(), Duration::from_secs(27));
    }

    #[tokio::test]
    async fn test_no_ips_is_ready() {
        let metrics = up_after(&[], 1, 1);
        assert!(wait_ready(&metrics, &[], &ReadinessConfig::default()).await);
        assert_eq!(metrics.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_queries_count_toward_the_interval() {
        let mut metrics = up_after(&["10.0.0.1:27684", "10.0.0.2:27684"], 2, 2);
        metrics.latency = Duration::from_secs(1);
        let start = tokio::time::Instant::now();
        assert!(wait_ready(&metrics, &ips(), &ReadinessConfig::default()).await);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_backend_is_bounded_by_rounds_times_interval() {
        let mut metrics = up_after(&["10.0.0.1:27684", "10.0.0.2:27684"], 1, 2);
        metrics.latency = Duration::from_secs(3600);
        let start = tokio::time::Instant::now();
        assert!(!wait_ready(&metrics, &ips(), &ReadinessConfig::default()).await);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(metrics.queries.load(Ordering::SeqCst), 20);
    }
}
