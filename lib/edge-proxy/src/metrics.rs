//! Prometheus metrics for the data plane
//!
//! [`MetricsCollector`] owns the registry served on the admin `/metrics`
//! endpoint. [`MetricsStreamer`] periodically pushes the same samples to
//! the telemetry service as NDJSON.

use crate::middleware::{Middleware, MiddlewareContext};
use crate::Result;
use anyhow::Context;
use futures::stream;
use prometheus::proto::MetricType;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const METRICS_PATH: &str = "/v1/metrics";
pub const NODE_ID_HEADER: &str = "x-node-id";

#[derive(Clone)]
pub struct MetricsCollector {
    pub http_requests_total: IntCounterVec,
    pub http_responses_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_rate_limited_total: IntCounterVec,
    pub upstream_rq_retry_total: IntCounterVec,
    pub upstream_health_transitions_total: IntCounterVec,
    /// Requests sent to priority 0 hosts because no priority had a healthy host
    pub upstream_panic_total: IntCounterVec,
    pub tcp_downstream_cx_total: IntCounterVec,
    pub tcp_downstream_cx_active: IntGaugeVec,
    pub tcp_downstream_cx_rx_bytes_total: IntCounterVec,
    pub tcp_downstream_cx_tx_bytes_total: IntCounterVec,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests by listener and cluster"),
            &["listener", "cluster"],
        )?;
        let http_responses_total = IntCounterVec::new(
            Opts::new("http_responses_total", "HTTP responses by cluster and status class"),
            &["cluster", "code_class"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Time from request received to response sent",
            ),
            &["cluster"],
        )?;
        let http_rate_limited_total = IntCounterVec::new(
            Opts::new("http_rate_limited_total", "Requests rejected by a rate limit"),
            &["route"],
        )?;
        let upstream_rq_retry_total = IntCounterVec::new(
            Opts::new("upstream_rq_retry_total", "Upstream request retries"),
            &["cluster"],
        )?;
        let upstream_health_transitions_total = IntCounterVec::new(
            Opts::new(
                "upstream_health_transitions_total",
                "Host health changes observed by active checks",
            ),
            &["cluster", "health"],
        )?;
        let upstream_panic_total = IntCounterVec::new(
            Opts::new("upstream_panic_total", "Host selections made in panic mode"),
            &["cluster"],
        )?;
        let tcp_downstream_cx_total = IntCounterVec::new(
            Opts::new("tcp_downstream_cx_total", "Downstream TCP connections"),
            &["stat_prefix"],
        )?;
        let tcp_downstream_cx_active = IntGaugeVec::new(
            Opts::new("tcp_downstream_cx_active", "Open downstream TCP connections"),
            &["stat_prefix"],
        )?;
        let tcp_downstream_cx_rx_bytes_total = IntCounterVec::new(
            Opts::new("tcp_downstream_cx_rx_bytes_total", "Bytes received from downstream"),
            &["stat_prefix"],
        )?;
        let tcp_downstream_cx_tx_bytes_total = IntCounterVec::new(
            Opts::new("tcp_downstream_cx_tx_bytes_total", "Bytes sent to downstream"),
            &["stat_prefix"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_responses_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_rate_limited_total.clone()))?;
        registry.register(Box::new(upstream_rq_retry_total.clone()))?;
        registry.register(Box::new(upstream_health_transitions_total.clone()))?;
        registry.register(Box::new(upstream_panic_total.clone()))?;
        registry.register(Box::new(tcp_downstream_cx_total.clone()))?;
        registry.register(Box::new(tcp_downstream_cx_active.clone()))?;
        registry.register(Box::new(tcp_downstream_cx_rx_bytes_total.clone()))?;
        registry.register(Box::new(tcp_downstream_cx_tx_bytes_total.clone()))?;

        Ok(Self {
            http_requests_total,
            http_responses_total,
            http_request_duration_seconds,
            http_rate_limited_total,
            upstream_rq_retry_total,
            upstream_health_transitions_total,
            upstream_panic_total,
            tcp_downstream_cx_total,
            tcp_downstream_cx_active,
            tcp_downstream_cx_rx_bytes_total,
            tcp_downstream_cx_tx_bytes_total,
            registry,
        })
    }

    pub fn record_health_transition(&self, cluster: &str, healthy: bool) {
        let health = if healthy { "healthy" } else { "unhealthy" };
        self.upstream_health_transitions_total
            .with_label_values(&[cluster, health])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Flatten the registry into samples; histograms yield `_count` and `_sum`
    pub fn samples(&self) -> Vec<MetricSample> {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let mut samples = Vec::new();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let labels: BTreeMap<String, String> = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                    .collect();
                let mut push = |name: String, kind: SampleKind, value: f64| {
                    samples.push(MetricSample {
                        name,
                        kind,
                        labels: labels.clone(),
                        value,
                        timestamp_ms,
                    })
                };
                match family.get_field_type() {
                    MetricType::COUNTER => push(
                        family.get_name().to_string(),
                        SampleKind::Counter,
                        metric.get_counter().get_value(),
                    ),
                    MetricType::GAUGE => push(
                        family.get_name().to_string(),
                        SampleKind::Gauge,
                        metric.get_gauge().get_value(),
                    ),
                    MetricType::HISTOGRAM => {
                        let histogram = metric.get_histogram();
                        push(
                            format!("{}_count", family.get_name()),
                            SampleKind::Counter,
                            histogram.get_sample_count() as f64,
                        );
                        push(
                            format!("{}_sum", family.get_name()),
                            SampleKind::Counter,
                            histogram.get_sample_sum(),
                        );
                    }
                    _ => {}
                }
            }
        }
        samples
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Counter,
    Gauge,
}

/// One line of a metrics stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub name: String,
    pub kind: SampleKind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Serialize items as newline-delimited JSON frames
pub fn ndjson_frames<T: Serialize>(items: &[T]) -> Vec<hyper::body::Bytes> {
    items
        .iter()
        .filter_map(|item| match serde_json::to_vec(item) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(hyper::body::Bytes::from(line))
            }
            Err(e) => {
                warn!(error = %e, "Dropping unserializable record");
                None
            }
        })
        .collect()
}

/// Pushes metric samples to the telemetry service on an interval
pub struct MetricsStreamer {
    collector: MetricsCollector,
    endpoint: String,
    node_id: String,
    interval: Duration,
    client: reqwest::Client,
}

impl MetricsStreamer {
    pub fn new(collector: MetricsCollector, endpoint: &str, node_id: &str, interval: Duration) -> Self {
        Self {
            collector,
            endpoint: format!("{}{}", endpoint.trim_end_matches('/'), METRICS_PATH),
            node_id: node_id.to_string(),
            interval,
            client: reqwest::Client::new(),
        }
    }

    /// Send one batch; returns the number of samples sent
    pub async fn push_once(&self) -> anyhow::Result<usize> {
        let frames = ndjson_frames(&self.collector.samples());
        let count = frames.len();
        let body = reqwest::Body::wrap_stream(stream::iter(
            frames.into_iter().map(Ok::<_, std::io::Error>),
        ));
        let response = self
            .client
            .post(&self.endpoint)
            .header(NODE_ID_HEADER, &self.node_id)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("pushing metrics to {}", self.endpoint))?;
        response.error_for_status()?;
        debug!(samples = count, "Pushed metrics");
        Ok(count)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.push_once().await {
                        warn!(error = %e, "Failed to push metrics");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Records request, response and latency metrics per cluster
pub struct MetricsMiddleware {
    collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

fn cluster_label(context: &MiddlewareContext) -> String {
    context.get_metadata("cluster").unwrap_or_else(|| "none".to_string())
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> anyhow::Result<()> {
        self.collector
            .http_requests_total
            .with_label_values(&[&context.listener, &cluster_label(context)])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> anyhow::Result<()> {
        let cluster = cluster_label(context);
        let class = format!("{}xx", status / 100);
        self.collector
            .http_responses_total
            .with_label_values(&[&cluster, &class])
            .inc();
        self.collector
            .http_request_duration_seconds
            .with_label_values(&[&cluster])
            .observe(context.elapsed().as_secs_f64());
        Ok(())
    }
}
