//! Endpoint management
use edge_api::v1::options::Locality;
use serde::{Deserialize, Serialize};

/// A discovered address of an upstream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub ready: bool,
    #[serde(default)]
    pub locality: Locality,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ready: true,
            locality: Locality::default(),
        }
    }
}
