use edge_api::ResourceRef;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SecretError>;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(ResourceRef),

    #[error("vault returned {status} for {path}: {message}")]
    Vault {
        status: u16,
        path: String,
        message: String,
    },

    #[error("failed to decode secret {0}: {1}")]
    Decode(ResourceRef, String),

    #[error("invalid secret source configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error(transparent)]
    Core(#[from] edge_core::CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SecretError {
    pub fn is_not_found(&self) -> bool {
        match self {
            SecretError::NotFound(_) => true,
            SecretError::Core(e) => e.is_not_found(),
            _ => false,
        }
    }
}
