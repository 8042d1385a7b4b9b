use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no route matched {host}{path}")]
    NoRoute { host: String, path: String },

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("no healthy upstream for cluster {0}")]
    NoHealthyUpstream(String),

    #[error("upstream connect error: {0}")]
    UpstreamConnect(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("CONNECT tunnel to {target} refused: {status}")]
    TunnelRefused { target: String, status: u16 },

    #[error("invalid TLS material: {0}")]
    Tls(String),

    #[error("invalid PROXY protocol header: {0}")]
    ProxyProtocol(String),

    #[error("downstream connection error: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid gRPC request: {0}")]
    Grpc(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),

    #[error(transparent)]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ProxyError {
    /// Status returned downstream when a request fails with this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute { .. } => StatusCode::NOT_FOUND,
            ProxyError::ClusterNotFound(_) | ProxyError::NoHealthyUpstream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnect(_)
            | ProxyError::TunnelRefused { .. }
            | ProxyError::Tls(_)
            | ProxyError::Client(_)
            | ProxyError::Hyper(_)
            | ProxyError::Io(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Grpc(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Envoy-style response flag recorded in access logs
    pub fn response_flag(&self) -> &'static str {
        match self {
            ProxyError::NoRoute { .. } => "NR",
            ProxyError::ClusterNotFound(_) => "NC",
            ProxyError::NoHealthyUpstream(_) => "UH",
            ProxyError::Timeout(_) => "UT",
            ProxyError::UpstreamConnect(_) | ProxyError::TunnelRefused { .. } => "UF",
            ProxyError::Unauthorized(_) => "UAEX",
            _ => "-",
        }
    }
}
