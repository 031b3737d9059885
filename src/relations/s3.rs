//! Object-storage parameters published by an S3 integrator

use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::store::{Databag, RelationEndpoint, RelationStore};

pub const BUCKET: &str = "bucket";
pub const REGION: &str = "region";
pub const ENDPOINT: &str = "endpoint";
pub const ACCESS_KEY: &str = "access-key";
pub const SECRET_KEY: &str = "secret-key";
pub const PATH: &str = "path";

/// Connection parameters for the backup bucket
#[derive(Clone, PartialEq, Eq)]
pub struct S3Parameters {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    /// Key prefix under which backups are stored, without slashes at either end
    pub path: String,
}

impl std::fmt::Debug for S3Parameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Parameters")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl S3Parameters {
    /// Parse the integrator's databag; missing bucket or keys block backups
    pub fn from_databag(data: &Databag) -> Result<Self> {
        let field = |key: &str| data.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let missing: Vec<&str> = [BUCKET, ACCESS_KEY, SECRET_KEY]
            .into_iter()
            .filter(|key| field(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::DataConflict(format!(
                "missing object storage parameters: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            bucket: field(BUCKET).unwrap_or_default().to_string(),
            region: field(REGION).map(str::to_string),
            endpoint: field(ENDPOINT).map(str::to_string),
            access_key: field(ACCESS_KEY).unwrap_or_default().to_string(),
            secret_key: field(SECRET_KEY).unwrap_or_default().to_string(),
            path: field(PATH).unwrap_or_default().trim_matches('/').to_string(),
        })
    }

    /// Parameters from the first established `s3-parameters` relation.
    ///
    /// `Ok(None)` when no integrator is related.
    pub async fn fetch(relations: &dyn RelationStore) -> Result<Option<Self>> {
        let ids = relations.relation_ids(RelationEndpoint::S3Parameters).await?;
        let Some(relation_id) = ids.into_iter().min() else {
            return Ok(None);
        };
        let data = relations
            .remote_data(RelationEndpoint::S3Parameters, relation_id)
            .await?;
        debug!(relation_id, keys = data.len(), "Read object storage parameters");
        Self::from_databag(&data).map(Some)
    }
}
