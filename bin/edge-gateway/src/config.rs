//! Gateway process configuration, read from the environment

use anyhow::Result;
use edge_api::v1::DEFAULT_PROXY_NAME;
use edge_api::xds;
use edge_core::settings::{parse, parse_default};
use std::time::Duration;

pub const CONTROLLER_ADDR: &str = "EDGE_CONTROLLER_ADDR";
pub const PROXY_NODE: &str = "EDGE_PROXY_NODE";
pub const ALS_ADDR: &str = "EDGE_ALS_ADDR";
pub const ADMIN_ADDR: &str = "EDGE_ADMIN_ADDR";
pub const METRICS_INTERVAL_SECS: &str = "EDGE_METRICS_INTERVAL_SECS";

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayConfig {
    /// Base URL of the controller's discovery server
    pub controller_addr: String,
    /// `namespace~proxy` of the Proxy this gateway serves
    pub node_id: String,
    /// Base URL of the telemetry service; streaming is off when unset
    pub als_addr: Option<String>,
    pub admin_addr: String,
    pub metrics_interval: Duration,
    /// Wait between failed discovery requests
    pub retry_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            controller_addr: "http://127.0.0.1:9977".to_string(),
            node_id: xds::node_id("edge-system", DEFAULT_PROXY_NAME),
            als_addr: None,
            admin_addr: "0.0.0.0:19000".to_string(),
            metrics_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            controller_addr: parse_default(CONTROLLER_ADDR, defaults.controller_addr)?,
            node_id: parse_default(PROXY_NODE, defaults.node_id)?,
            als_addr: parse(ALS_ADDR)?,
            admin_addr: parse_default(ADMIN_ADDR, defaults.admin_addr)?,
            metrics_interval: Duration::from_secs(parse_default(
                METRICS_INTERVAL_SECS,
                defaults.metrics_interval.as_secs(),
            )?),
            retry_interval: defaults.retry_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_node() {
        assert_eq!(GatewayConfig::default().node_id, "edge-system~gateway-proxy");
    }
}
