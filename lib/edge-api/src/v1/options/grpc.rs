use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// gRPC-Web is on by default for HTTP listeners
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrpcWeb {
    #[serde(default)]
    pub disable: bool,
}

/// gRPC-JSON transcoding for an upstream
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrpcJsonTranscoder {
    /// Base64-encoded `FileDescriptorSet`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto_descriptor_bin: Option<String>,

    /// Fully qualified gRPC service names
    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default)]
    pub match_incoming_request_route: bool,

    #[serde(default)]
    pub auto_mapping: bool,
}
