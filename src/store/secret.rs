//! Application secret storage

use async_trait::async_trait;

use super::StoreError;

/// Key-value store for passwords and private keys
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a key; deleting a missing key succeeds
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Every key currently stored, in no particular order
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Map a unit id onto a key fragment valid in Kubernetes Secret data
pub fn unit_key(prefix: &str, unit: &str) -> String {
    format!("{}-{}", prefix, unit.replace('/', "-"))
}
