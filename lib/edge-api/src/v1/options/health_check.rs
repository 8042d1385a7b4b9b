use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Active health check configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Timeout for one check (ms)
    #[serde(default = "default_health_check_timeout")]
    pub timeout_ms: u64,

    /// Interval between checks (ms)
    #[serde(default = "default_health_check_interval")]
    pub interval_ms: u64,

    /// Consecutive failures before marking unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before marking healthy
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    #[serde(default)]
    pub kind: HealthCheckKind,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_check_timeout(),
            interval_ms: default_health_check_interval(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
            kind: HealthCheckKind::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum HealthCheckKind {
    Http(HttpHealthCheck),
    #[default]
    Tcp,
    Grpc(GrpcHealthCheck),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheck {
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Defaults to 200 only
    #[serde(default)]
    pub expected_statuses: Vec<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrpcHealthCheck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

/// Passive health checking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutlierDetection {
    #[serde(default = "default_consecutive_5xx")]
    pub consecutive_5xx: u32,

    #[serde(default = "default_outlier_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_base_ejection_time")]
    pub base_ejection_time_ms: u64,

    #[serde(default = "default_max_ejection_percent")]
    pub max_ejection_percent: u32,
}

impl Default for OutlierDetection {
    fn default() -> Self {
        Self {
            consecutive_5xx: default_consecutive_5xx(),
            interval_ms: default_outlier_interval(),
            base_ejection_time_ms: default_base_ejection_time(),
            max_ejection_percent: default_max_ejection_percent(),
        }
    }
}

fn default_health_check_interval() -> u64 {
    10_000
}

fn default_health_check_timeout() -> u64 {
    5_000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_consecutive_5xx() -> u32 {
    5
}

fn default_outlier_interval() -> u64 {
    10_000
}

fn default_base_ejection_time() -> u64 {
    30_000
}

fn default_max_ejection_percent() -> u32 {
    10
}
