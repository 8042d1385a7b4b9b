use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Local rate limits
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

/// One limit keyed by a request descriptor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Unique within one policy
    pub name: String,

    pub descriptor: Descriptor,

    pub requests_per_unit: u32,

    pub unit: TimeUnit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Descriptor {
    /// Downstream client address
    RemoteAddress,
    /// Value of a request header; requests without it are not limited
    RequestHeader {
        #[serde(rename = "headerName")]
        header_name: String,
    },
    /// Same key for every request
    GenericKey { value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86_400),
        }
    }
}
