use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Access logging configured on a listener
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessLoggingService {
    #[serde(default)]
    pub access_log: Vec<AccessLog>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessLog {
    pub output: AccessLogOutput,

    /// Only log entries accepted by the filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<AccessLogFilter>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum AccessLogOutput {
    /// Write formatted entries to a file (`/dev/stdout` is accepted)
    File(FileSink),
    /// Stream structured entries to the access-log service
    Streaming(StreamingSink),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSink {
    pub path: String,

    /// Defaults to the Envoy default string format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum FileFormat {
    StringFormat(String),
    /// Keys map to command-operator format strings
    JsonFormat(BTreeMap<String, String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSink {
    /// Name attached to every batch so the service can tell logs apart
    pub log_name: String,

    /// Override of the access-log service address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogFilter {
    /// Minimum response status to log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code_min: Option<u16>,

    /// Drop requests carrying the health-check user agent
    #[serde(default)]
    pub not_health_check: bool,
}
