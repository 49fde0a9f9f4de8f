use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use fleet_common::{MetricSample, Series};

/// Read access to the metrics backend.
///
/// Both queries are non-fatal: a backend failure or an unexpected payload
/// is logged and yields an empty result.
#[async_trait]
pub trait MetricsQuery: Send + Sync {
    async fn instant_query(&self, promql: &str) -> Vec<MetricSample>;

    async fn range_query(&self, promql: &str, start: f64, end: f64, step: Duration) -> Vec<Series>;
}

/// Prometheus HTTP API client.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch<R: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> anyhow::Result<Vec<R>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        let body: ApiResponse<R> = resp
            .json()
            .await
            .with_context(|| format!("decode response from {url} ({status})"))?;

        if body.status != "success" {
            bail!(
                "query rejected ({status}): {}",
                body.error.unwrap_or_else(|| "no error message".to_string())
            );
        }
        Ok(body.data.map(|d| d.result).unwrap_or_default())
    }
}

#[async_trait]
impl MetricsQuery for PrometheusClient {
    async fn instant_query(&self, promql: &str) -> Vec<MetricSample> {
        let params = [("query", promql.to_string())];
        match self.fetch::<VectorEntry>("/api/v1/query", &params).await {
            Ok(entries) => entries.into_iter().filter_map(VectorEntry::into_sample).collect(),
            Err(e) => {
                tracing::warn!(query = promql, error = format!("{e:#}"), "instant query failed");
                Vec::new()
            }
        }
    }

    async fn range_query(&self, promql: &str, start: f64, end: f64, step: Duration) -> Vec<Series> {
        let params = [
            ("query", promql.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];
        match self.fetch::<MatrixEntry>("/api/v1/query_range", &params).await {
            Ok(entries) => entries.into_iter().map(MatrixEntry::into_series).collect(),
            Err(e) => {
                tracing::warn!(query = promql, error = format!("{e:#}"), "range query failed");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<R> {
    status: String,
    #[serde(default = "Option::default")]
    data: Option<QueryData<R>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData<R> {
    result: Vec<R>,
}

#[derive(Debug, Deserialize)]
struct VectorEntry {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

impl VectorEntry {
    fn into_sample(self) -> Option<MetricSample> {
        let (timestamp, raw) = self.value;
        let value = raw.parse().ok()?;
        Some(MetricSample {
            labels: self.metric,
            timestamp,
            value,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MatrixEntry {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl MatrixEntry {
    fn into_series(self) -> Series {
        Series {
            labels: self.metric,
            points: self
                .values
                .into_iter()
                .filter_map(|(ts, raw)| raw.parse().ok().map(|v| (ts, v)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn client(server: &MockServer) -> PrometheusClient {
        PrometheusClient::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_instant_query_parses_vector() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "up"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [
                        {"metric": {"instance": "10.0.0.1:27684"}, "value": [1700000000.5, "1"]},
                        {"metric": {"instance": "10.0.0.2:27684"}, "value": [1700000000.5, "0"]}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let samples = client(&server).await.instant_query("up").await;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label("instance"), Some("10.0.0.1:27684"));
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[1].value, 0.0);
        assert_eq!(samples[0].timestamp, 1700000000.5);
    }

    #[tokio::test]
    async fn test_error_status_yields_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "error",
                "errorType": "bad_data",
                "error": "parse error"
            })))
            .mount(&server)
            .await;

        assert!(client(&server).await.instant_query("up{").await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_yields_empty() {
        let client = PrometheusClient::new("http://127.0.0.1:9", Duration::from_millis(300)).unwrap();
        assert!(client.instant_query("up").await.is_empty());
    }

    #[tokio::test]
    async fn test_range_query_parses_matrix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param("step", "60s"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "resultType": "matrix",
                    "result": [{
                        "metric": {"instance": "10.0.0.1:27684"},
                        "values": [[100.0, "0.5"], [160.0, "NaN"], [220.0, "0.75"]]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let series = client(&server)
            .await
            .range_query("rate(x[5m])", 100.0, 220.0, Duration::from_secs(60))
            .await;
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].points.len(), 3);
        assert_eq!(series[0].points[0], (100.0, 0.5));
        assert!(series[0].points[1].1.is_nan());
    }
}
