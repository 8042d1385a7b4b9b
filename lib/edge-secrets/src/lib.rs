//! Secret sources
//!
//! Secrets referenced by upstreams and listeners are read through a
//! [`SecretSource`]. Sources can be combined with [`MultiSecretSource`],
//! which consults Kubernetes first, then the in-memory store, then Vault.

pub mod error;
pub mod kubernetes;
pub mod memory;
pub mod multi;
pub mod source;
pub mod vault;

pub use error::{Result, SecretError};
pub use kubernetes::KubernetesSecretSource;
pub use memory::MemorySecretSource;
pub use multi::MultiSecretSource;
pub use source::{Precedence, SecretSource};
pub use vault::VaultSecretSource;
