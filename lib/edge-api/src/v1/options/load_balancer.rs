use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Load balancer configuration of an upstream
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Percent of healthy hosts below which all hosts receive traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy_panic_threshold: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_merge_window_ms: Option<u64>,

    #[serde(default)]
    pub policy: LoadBalancerPolicy,

    /// Pick localities by weight before picking a host
    #[serde(default)]
    pub locality_weighted: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancerPolicy {
    #[default]
    RoundRobin,
    LeastRequest(LeastRequestConfig),
    Random,
    RingHash(RingHashConfig),
    Maglev,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeastRequestConfig {
    #[serde(default = "default_choice_count")]
    pub choice_count: u32,
}

impl Default for LeastRequestConfig {
    fn default() -> Self {
        Self {
            choice_count: default_choice_count(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RingHashConfig {
    #[serde(default = "default_minimum_ring_size")]
    pub minimum_ring_size: u64,

    #[serde(default = "default_maximum_ring_size")]
    pub maximum_ring_size: u64,
}

impl Default for RingHashConfig {
    fn default() -> Self {
        Self {
            minimum_ring_size: default_minimum_ring_size(),
            maximum_ring_size: default_maximum_ring_size(),
        }
    }
}

fn default_choice_count() -> u32 {
    2
}

fn default_minimum_ring_size() -> u64 {
    1024
}

fn default_maximum_ring_size() -> u64 {
    8 * 1024 * 1024
}
