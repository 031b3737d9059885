//! Relation data bags exchanged with other applications

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::StoreError;
use crate::constants::{DB_RELATION_NAME, S3_INTEGRATOR_RELATION_NAME, TLS_RELATION};

/// String map published on one side of a relation
pub type Databag = BTreeMap<String, String>;

/// Relation endpoints this application takes part in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationEndpoint {
    /// Client applications requesting databases
    Database,
    /// Certificate authority issuing unit certificates
    Certificates,
    /// Object storage parameters for backups
    S3Parameters,
}

impl RelationEndpoint {
    pub const ALL: [RelationEndpoint; 3] = [
        RelationEndpoint::Database,
        RelationEndpoint::Certificates,
        RelationEndpoint::S3Parameters,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RelationEndpoint::Database => DB_RELATION_NAME,
            RelationEndpoint::Certificates => TLS_RELATION,
            RelationEndpoint::S3Parameters => S3_INTEGRATOR_RELATION_NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|endpoint| endpoint.name() == name)
    }
}

impl std::fmt::Display for RelationEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Access to relation data bags from one unit's point of view
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Ids of the relations currently established on `endpoint`
    async fn relation_ids(&self, endpoint: RelationEndpoint) -> Result<Vec<u32>, StoreError>;

    /// Application data published by the remote side
    async fn remote_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError>;

    /// Application data this side has published
    async fn local_app_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError>;

    /// Replace this side's application data
    async fn set_local_app_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        data: Databag,
    ) -> Result<(), StoreError>;

    /// Data this unit has published
    async fn local_unit_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
    ) -> Result<Databag, StoreError>;

    /// Replace this unit's data
    async fn set_local_unit_data(
        &self,
        endpoint: RelationEndpoint,
        relation_id: u32,
        data: Databag,
    ) -> Result<(), StoreError>;
}
