//! Receives access-log and metric streams from gateways
//!
//! Both streams are newline-delimited JSON. Lines are decoded as they arrive;
//! a line that fails to decode is counted and skipped. A line longer than
//! [`MAX_LINE_BYTES`] ends the stream with [`LineTooLong`].

use anyhow::Result;
use edge_proxy::{AccessLogEntry, MetricSample};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("stream line exceeds {MAX_LINE_BYTES} bytes")]
pub struct LineTooLong;

/// Outcome of one stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StreamSummary {
    pub accepted: usize,
    pub rejected: usize,
}

pub struct TelemetrySink {
    registry: Registry,
    access_log_entries: IntCounterVec,
    metric_samples: IntCounterVec,
    decode_errors: IntCounter,
    // Latest samples pushed by each node
    nodes: RwLock<HashMap<String, Vec<MetricSample>>>,
}

impl TelemetrySink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let access_log_entries = IntCounterVec::new(
            Opts::new("telemetry_access_log_entries_total", "Access log entries received"),
            &["log_name", "response_class"],
        )?;
        let metric_samples = IntCounterVec::new(
            Opts::new("telemetry_metric_samples_total", "Metric samples received"),
            &["node"],
        )?;
        let decode_errors = IntCounter::new(
            "telemetry_decode_errors_total",
            "Stream lines that could not be decoded",
        )?;
        registry.register(Box::new(access_log_entries.clone()))?;
        registry.register(Box::new(metric_samples.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;

        Ok(Self {
            registry,
            access_log_entries,
            metric_samples,
            decode_errors,
            nodes: RwLock::new(HashMap::new()),
        })
    }

    pub async fn receive_access_logs<B>(&self, log_name: &str, body: B) -> Result<StreamSummary>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        read_ndjson(body, |line| match decode::<AccessLogEntry>(line) {
            Some(entry) => {
                self.record_access_log(log_name, &entry);
                true
            }
            None => {
                self.decode_errors.inc();
                false
            }
        })
        .await
    }

    fn record_access_log(&self, log_name: &str, entry: &AccessLogEntry) {
        let class = format!("{}xx", entry.response_code / 100);
        self.access_log_entries
            .with_label_values(&[log_name, &class])
            .inc();
        info!(
            target: "access_log",
            log_name = %log_name,
            start_time = %entry.start_time,
            method = %entry.method,
            path = %entry.path,
            authority = %entry.authority,
            response_code = entry.response_code,
            response_flags = %entry.response_flags,
            duration_ms = entry.duration_ms,
            bytes_received = entry.bytes_received,
            bytes_sent = entry.bytes_sent,
            upstream_cluster = entry.upstream_cluster.as_deref().unwrap_or("-"),
            upstream_host = entry.upstream_host.as_deref().unwrap_or("-"),
            remote = %entry.downstream_remote_address,
        );
    }

    pub async fn receive_metrics<B>(&self, node: &str, body: B) -> Result<StreamSummary>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        let mut samples = Vec::new();
        let summary = read_ndjson(body, |line| match decode::<MetricSample>(line) {
            Some(sample) => {
                samples.push(sample);
                true
            }
            None => {
                self.decode_errors.inc();
                false
            }
        })
        .await?;

        self.metric_samples
            .with_label_values(&[node])
            .inc_by(summary.accepted as u64);
        debug!(node = %node, samples = summary.accepted, "Received metrics");
        self.nodes.write().await.insert(node.to_string(), samples);
        Ok(summary)
    }

    /// Latest samples a node pushed
    pub async fn node_metrics(&self, node: &str) -> Option<Vec<MetricSample>> {
        self.nodes.read().await.get(node).cloned()
    }

    pub async fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn gather(&self) -> Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn decode<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    match serde_json::from_slice(line) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable stream line");
            None
        }
    }
}

/// Feed every non-empty line of `body` to `on_line`, frame by frame
async fn read_ndjson<B, F>(mut body: B, mut on_line: F) -> Result<StreamSummary>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
    F: FnMut(&[u8]) -> bool,
{
    let mut summary = StreamSummary::default();
    let mut pending: Vec<u8> = Vec::new();
    let mut handle = |line: &[u8], summary: &mut StreamSummary| {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        if on_line(line) {
            summary.accepted += 1;
        } else {
            summary.rejected += 1;
        }
    };

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| anyhow::anyhow!("reading stream: {}", e))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        pending.extend_from_slice(&data);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            handle(&line, &mut summary);
        }
        if pending.len() > MAX_LINE_BYTES {
            warn!(buffered = pending.len(), "Refusing stream with an oversized line");
            return Err(LineTooLong.into());
        }
    }
    handle(&pending, &mut summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_proxy::metrics::SampleKind;
    use futures::stream;
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;
    use std::collections::BTreeMap;

    fn entry(code: u16) -> AccessLogEntry {
        AccessLogEntry {
            method: "GET".into(),
            path: "/pets".into(),
            protocol: "HTTP/1.1".into(),
            response_code: code,
            response_flags: "-".into(),
            downstream_remote_address: "10.0.0.1:5000".into(),
            ..Default::default()
        }
    }

    fn line<T: Serialize>(value: &T) -> String {
        format!("{}\n", serde_json::to_string(value).unwrap())
    }

    #[tokio::test]
    async fn test_access_logs_split_across_frames() {
        let sink = TelemetrySink::new().unwrap();
        let payload = format!("{}{}not json\n\n", line(&entry(200)), line(&entry(503)));
        // split mid-line to exercise buffering
        let (a, b) = payload.split_at(17);
        let frames = vec![
            Ok::<_, std::io::Error>(Frame::data(Bytes::from(a.to_string()))),
            Ok(Frame::data(Bytes::from(b.to_string()))),
        ];
        let body = StreamBody::new(stream::iter(frames));

        let summary = sink.receive_access_logs("gateway", body).await.unwrap();
        assert_eq!(summary, StreamSummary { accepted: 2, rejected: 1 });
        assert_eq!(
            sink.access_log_entries.with_label_values(&["gateway", "5xx"]).get(),
            1
        );
        assert_eq!(sink.decode_errors.get(), 1);
    }

    #[tokio::test]
    async fn test_unterminated_line_is_bounded() {
        let sink = TelemetrySink::new().unwrap();
        let chunk = Bytes::from(vec![b'x'; 64 * 1024]);
        let frames = (0..=MAX_LINE_BYTES / chunk.len())
            .map(|_| Ok::<_, std::io::Error>(Frame::data(chunk.clone())))
            .collect::<Vec<_>>();
        let body = StreamBody::new(stream::iter(frames));

        let err = sink.receive_access_logs("gateway", body).await.unwrap_err();
        assert!(err.downcast_ref::<LineTooLong>().is_some());
    }

    #[tokio::test]
    async fn test_metrics_keep_latest_per_node() {
        let sink = TelemetrySink::new().unwrap();
        let sample = |value: f64| MetricSample {
            name: "upstream_rq_total".into(),
            kind: SampleKind::Counter,
            labels: BTreeMap::from([("cluster".to_string(), "petstore_default".to_string())]),
            value,
            timestamp_ms: 0,
        };

        let body = Full::new(Bytes::from(line(&sample(1.0))));
        sink.receive_metrics("ns~proxy", body).await.unwrap();
        let body = Full::new(Bytes::from(format!("{}{}", line(&sample(2.0)), line(&sample(3.0)))));
        let summary = sink.receive_metrics("ns~proxy", body).await.unwrap();
        assert_eq!(summary.accepted, 2);

        let latest = sink.node_metrics("ns~proxy").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].value, 3.0);
        assert_eq!(sink.nodes().await, vec!["ns~proxy".to_string()]);
        assert_eq!(sink.metric_samples.with_label_values(&["ns~proxy"]).get(), 3);
        assert!(sink.gather().unwrap().contains("telemetry_metric_samples_total"));
    }
}
