/// API version v1 for edge gateway CRDs

pub mod core;
pub mod gateway;
pub mod options;
pub mod proxy;
pub mod secret;
pub mod upstream;
pub mod virtual_service;

pub use gateway::Gateway;
pub use proxy::Proxy;
pub use secret::Secret;
pub use upstream::Upstream;
pub use virtual_service::VirtualService;

/// API group for edge gateway resources
pub const API_GROUP: &str = "gateway.edge.dev";
/// API version for edge gateway resources
pub const API_VERSION: &str = "v1";

/// Label set on every Proxy the gateway translator generates
pub const CREATED_BY_LABEL: &str = "created_by";
/// Value of [`CREATED_BY_LABEL`] on generated proxies
pub const CREATED_BY_VALUE: &str = "edge-gateway";

/// Proxy name used when a Gateway does not list any
pub const DEFAULT_PROXY_NAME: &str = "gateway-proxy";
