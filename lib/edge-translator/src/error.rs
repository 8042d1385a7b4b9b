use edge_api::ResourceRef;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TranslateError>;

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("No health checks or outlier detection present, at least one is required to enable failover")]
    FailoverWithoutHealthChecks,

    #[error("Weights cannot be supplied alongside a DNS host in a prioritized locality")]
    FailoverDnsWeight,

    #[error("upstream {0} not found")]
    UpstreamNotFound(ResourceRef),

    #[error("secret {0} not found")]
    SecretNotFound(ResourceRef),

    #[error("secret {0} is not a TLS secret")]
    NotTlsSecret(ResourceRef),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Core(#[from] edge_core::CoreError),

    #[error(transparent)]
    Secret(#[from] edge_secrets::SecretError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
