//! Storage collaborators: peer key space, relation data bags and secrets
//!
//! Each concern is a trait so the reconciliation core runs against either the
//! Kubernetes-backed adapters in [`kube`] or the in-memory ones in [`memory`].

pub mod kube;
pub mod memory;
pub mod peer;
pub mod relation;
pub mod secret;

use thiserror::Error;

pub use memory::{MemoryPeerStore, MemoryRelationStore, MemorySecretStore};
pub use peer::{PeerScope, PeerSnapshot, PeerStateStore, PeerVersion, PeerWrite};
pub use relation::{Databag, RelationEndpoint, RelationStore};
pub use secret::{SecretStore, unit_key};

/// Errors returned by storage collaborators
#[derive(Error, Debug)]
pub enum StoreError {
    /// A compare-and-set write lost against a concurrent writer
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Backing service temporarily unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored data cannot be interpreted
    #[error("invalid stored data: {0}")]
    Invalid(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Conflict { .. } => true,
            StoreError::Kube(::kube::Error::Api(api_err)) => api_err.code == 409,
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict { .. } | StoreError::Unavailable(_) => true,
            StoreError::Kube(::kube::Error::Api(api_err)) => {
                let code = api_err.code;
                !(400..500).contains(&code) || code == 409 || code == 429
            }
            StoreError::Kube(_) => true,
            StoreError::NotFound(_) | StoreError::Invalid(_) | StoreError::Serialization(_) => {
                false
            }
        }
    }
}
