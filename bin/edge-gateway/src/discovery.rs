//! Long-poll client for the controller's discovery server

use anyhow::{bail, Context, Result};
use edge_api::xds::Snapshot;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Longer than the server's poll timeout so a quiet poll ends in a 304
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DiscoveryClient {
    client: reqwest::Client,
    url: String,
}

impl DiscoveryClient {
    pub fn new(controller_addr: &str, node_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/discovery/{}", controller_addr.trim_end_matches('/'), node_id),
        })
    }

    /// Wait for a snapshot newer than `known`; `None` when the poll expired
    pub async fn fetch(&self, known: Option<&str>) -> Result<Option<Snapshot>> {
        let mut request = self.client.get(&self.url);
        if let Some(version) = known {
            request = request.query(&[("version", version)]);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("polling {}", self.url))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!(known = ?known, "No configuration change");
                Ok(None)
            }
            StatusCode::OK => Ok(Some(response.json().await?)),
            status => bail!("discovery request to {} failed with {}", self.url, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one request with `response` and hands back the request head
    async fn one_shot(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_fetch_snapshot() {
        let body = r#"{"version":"v7","listeners":[]}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (addr, head) = one_shot(response).await;
        let client = DiscoveryClient::new(&addr, "ns~proxy").unwrap();

        let snapshot = client.fetch(Some("v6")).await.unwrap().unwrap();
        assert_eq!(snapshot.version, "v7");
        assert!(head.await.unwrap().starts_with("GET /v1/discovery/ns~proxy?version=v6 "));
    }

    #[tokio::test]
    async fn test_not_modified() {
        let (addr, _) = one_shot("HTTP/1.1 304 Not Modified\r\ncontent-length: 0\r\n\r\n").await;
        let client = DiscoveryClient::new(&addr, "ns~proxy").unwrap();
        assert!(client.fetch(Some("v1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error() {
        let (addr, _) = one_shot("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n").await;
        let client = DiscoveryClient::new(&addr, "ns~proxy").unwrap();
        assert!(client.fetch(None).await.is_err());
    }
}
