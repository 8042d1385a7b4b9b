//! TCP proxying for `tcp_proxy` filter chains

use crate::cluster::ClusterManager;
use crate::error::ProxyError;
use crate::forwarder::DEFAULT_CONNECT_TIMEOUT;
use crate::metrics::MetricsCollector;
use crate::Result;
use edge_api::xds;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct TcpProxy {
    config: xds::TcpProxy,
    clusters: Arc<ClusterManager>,
    metrics: Option<MetricsCollector>,
}

impl TcpProxy {
    pub fn new(config: xds::TcpProxy, clusters: Arc<ClusterManager>, metrics: Option<MetricsCollector>) -> Self {
        Self {
            config,
            clusters,
            metrics,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.config.cluster
    }

    /// Pipe `downstream` to a host of the cluster until either side closes.
    /// Returns bytes received from and sent to downstream.
    pub async fn handle<S>(&self, mut downstream: S, remote: SocketAddr) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let prefix = self.config.stat_prefix.as_str();
        if let Some(metrics) = &self.metrics {
            metrics.tcp_downstream_cx_total.with_label_values(&[prefix]).inc();
            metrics.tcp_downstream_cx_active.with_label_values(&[prefix]).inc();
        }
        let result = self.pipe(&mut downstream, remote).await;
        if let Some(metrics) = &self.metrics {
            metrics.tcp_downstream_cx_active.with_label_values(&[prefix]).dec();
            if let Ok((rx, tx)) = &result {
                metrics
                    .tcp_downstream_cx_rx_bytes_total
                    .with_label_values(&[prefix])
                    .inc_by(*rx);
                metrics
                    .tcp_downstream_cx_tx_bytes_total
                    .with_label_values(&[prefix])
                    .inc_by(*tx);
            }
        }
        result
    }

    async fn pipe<S>(&self, downstream: &mut S, remote: SocketAddr) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cluster = self
            .clusters
            .get(&self.config.cluster)
            .await
            .ok_or_else(|| ProxyError::ClusterNotFound(self.config.cluster.clone()))?;
        let remote_ip = remote.ip().to_string();
        let host = cluster.select_host(Some(&remote_ip))?;
        let _guard = host.start_request();

        let connect_timeout = cluster
            .config
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let mut upstream = match timeout(connect_timeout, TcpStream::connect(host.authority())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                cluster.record_response(&host, 503);
                return Err(ProxyError::UpstreamConnect(format!("{}: {}", host.authority(), e)));
            }
            Err(_) => {
                cluster.record_response(&host, 504);
                return Err(ProxyError::UpstreamConnect(format!("{}: connect timeout", host.authority())));
            }
        };
        debug!(stat_prefix = %self.config.stat_prefix, remote = %remote, upstream = %host.authority(), "TCP connection established");

        match copy_bidirectional(downstream, &mut upstream).await {
            Ok((rx, tx)) => {
                debug!(stat_prefix = %self.config.stat_prefix, rx, tx, "TCP connection closed");
                Ok((rx, tx))
            }
            Err(e) => {
                warn!(stat_prefix = %self.config.stat_prefix, error = %e, "TCP connection failed");
                Err(e.into())
            }
        }
    }
}
