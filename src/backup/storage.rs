//! Object store construction from integrator parameters

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::relations::S3Parameters;

/// Builds the object store backups are written to
pub trait ObjectStoreProvider: Send + Sync {
    fn store(&self, params: &S3Parameters) -> Result<Arc<dyn ObjectStore>>;
}

/// S3 or S3-compatible storage
#[derive(Clone, Debug, Default)]
pub struct S3StoreProvider;

impl ObjectStoreProvider for S3StoreProvider {
    fn store(&self, params: &S3Parameters) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&params.bucket)
            .with_access_key_id(&params.access_key)
            .with_secret_access_key(&params.secret_key);

        if let Some(region) = &params.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &params.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"))
                .with_virtual_hosted_style_request(false);
        }

        let store = builder.build().map_err(|e| {
            Error::DataConflict(format!("invalid object storage parameters: {}", e))
        })?;
        info!(bucket = %params.bucket, endpoint = ?params.endpoint, "Using S3 object store");
        Ok(Arc::new(store))
    }
}

/// One in-memory store shared by every call, whatever the parameters
#[derive(Clone, Debug, Default)]
pub struct InMemoryStoreProvider {
    store: Arc<InMemory>,
}

impl InMemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> Arc<InMemory> {
        self.store.clone()
    }
}

impl ObjectStoreProvider for InMemoryStoreProvider {
    fn store(&self, _params: &S3Parameters) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.store.clone())
    }
}
