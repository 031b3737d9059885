//! Database provisioning for client applications
//!
//! A client publishes `{database}` on its side of a `database` relation. The
//! leader answers with a user scoped to that database and the endpoints to
//! reach the cluster. Requests that arrive before the cluster is initialized
//! are deferred and picked up again by [`DatabaseProvider::reconcile_all`].

use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde_json::ser::Formatter;
use tracing::{debug, info, instrument, warn};

use crate::admin::ClusterAdmin;
use crate::admin::sql::is_valid_database_name;
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryPolicy;
use crate::credentials::{CredentialStore, ScopedCredential};
use crate::leadership::Leadership;
use crate::store::{Databag, RelationEndpoint, RelationStore};

// Response keys
pub const DATA: &str = "data";
pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const ENDPOINTS: &str = "endpoints";
pub const READ_ONLY_ENDPOINTS: &str = "read-only-endpoints";
pub const DATABASE: &str = "database";
pub const VERSION: &str = "version";

/// JSON with a space after every `,` and `:`, the form clients compare the
/// echoed request against
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn to_spaced_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(buffer).map_err(|e| Error::Fatal(format!("request is not UTF-8: {}", e)))
}

/// What handling a request did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The remote side has not asked for a database yet
    NoRequest,
    /// Waiting for leadership or an initialized cluster
    Deferred(String),
    /// Published data already answers the request
    Unchanged,
    /// A response was published
    Published,
}

/// Serves the `database` relation
#[derive(Clone)]
pub struct DatabaseProvider {
    relations: Arc<dyn RelationStore>,
    credentials: CredentialStore,
    admin: Arc<dyn ClusterAdmin>,
    retry: RetryPolicy,
    primary_endpoint: String,
    replicas_endpoint: String,
}

impl DatabaseProvider {
    pub fn new(
        relations: Arc<dyn RelationStore>,
        credentials: CredentialStore,
        admin: Arc<dyn ClusterAdmin>,
        retry: RetryPolicy,
        primary_endpoint: String,
        replicas_endpoint: String,
    ) -> Self {
        Self {
            relations,
            credentials,
            admin,
            retry,
            primary_endpoint,
            replicas_endpoint,
        }
    }

    /// Answer the request on one relation
    #[instrument(skip(self))]
    pub async fn handle_request(
        &self,
        relation_id: u32,
        leadership: Leadership,
        cluster_active: bool,
    ) -> Result<RequestOutcome> {
        let request = self
            .relations
            .remote_data(RelationEndpoint::Database, relation_id)
            .await?;
        let Some(database) = request.get(DATABASE).filter(|d| !d.is_empty()) else {
            return Ok(RequestOutcome::NoRequest);
        };

        if !leadership.is_leader() {
            return Ok(RequestOutcome::Deferred("only the leader provisions databases".into()));
        }
        if !cluster_active {
            debug!(relation_id, %database, "Cluster not initialized, deferring request");
            return Ok(RequestOutcome::Deferred("cluster not initialized yet".into()));
        }
        if !is_valid_database_name(database) {
            return Err(Error::DataConflict(format!(
                "relation {} requested invalid database name {:?}",
                relation_id, database
            )));
        }

        let credential = match self.credentials.scoped_credential(relation_id).await? {
            Some(existing) if existing.database == *database => existing,
            Some(existing) => {
                return Err(Error::DataConflict(format!(
                    "relation {} already holds a user for database {}, not {}",
                    relation_id, existing.database, database
                )));
            }
            None => {
                self.credentials
                    .issue_scoped_credential(relation_id, database)
                    .await?
            }
        };

        let published = self
            .relations
            .local_app_data(RelationEndpoint::Database, relation_id)
            .await?;
        let raw_request = to_spaced_json(&request)?;
        if self.answers(&published, &credential, &raw_request) {
            return Ok(RequestOutcome::Unchanged);
        }

        let admin = self.admin.clone();
        let scoped = credential.clone();
        self.retry
            .run("create-scoped-user", move || {
                let admin = admin.clone();
                let scoped = scoped.clone();
                async move {
                    admin
                        .create_scoped_user(&scoped.database, &scoped.username, &scoped.password)
                        .await
                        .map_err(Error::from)
                }
            })
            .await?;
        let admin = self.admin.clone();
        let version = self
            .retry
            .run("server-version", move || {
                let admin = admin.clone();
                async move { admin.server_version().await.map_err(Error::from) }
            })
            .await?;

        let response = Databag::from([
            (DATA.to_string(), raw_request),
            (USERNAME.to_string(), credential.username.clone()),
            (PASSWORD.to_string(), credential.password.clone()),
            (ENDPOINTS.to_string(), self.primary_endpoint.clone()),
            (READ_ONLY_ENDPOINTS.to_string(), self.replicas_endpoint.clone()),
            (DATABASE.to_string(), credential.database.clone()),
            (VERSION.to_string(), version),
        ]);
        self.relations
            .set_local_app_data(RelationEndpoint::Database, relation_id, response)
            .await?;
        info!(
            relation_id,
            database = %credential.database,
            username = %credential.username,
            "Published database credentials"
        );
        Ok(RequestOutcome::Published)
    }

    /// Whether `published` already answers this request with `credential`
    fn answers(&self, published: &Databag, credential: &ScopedCredential, raw_request: &str) -> bool {
        let expected = [
            (DATA, raw_request),
            (USERNAME, credential.username.as_str()),
            (PASSWORD, credential.password.as_str()),
            (ENDPOINTS, self.primary_endpoint.as_str()),
            (READ_ONLY_ENDPOINTS, self.replicas_endpoint.as_str()),
            (DATABASE, credential.database.as_str()),
        ];
        published.contains_key(VERSION)
            && expected
                .iter()
                .all(|(key, value)| published.get(*key).map(String::as_str) == Some(*value))
    }

    /// Re-derive every relation's response.
    ///
    /// Each relation is handled independently; the first error is returned
    /// after all of them were tried. The leader also revokes credentials whose
    /// relation no longer exists, so a missed break is caught up later.
    pub async fn reconcile_all(
        &self,
        leadership: Leadership,
        cluster_active: bool,
    ) -> Result<Vec<(u32, RequestOutcome)>> {
        let mut outcomes = Vec::new();
        let mut first_error = None;
        let relation_ids = self.relations.relation_ids(RelationEndpoint::Database).await?;

        if leadership.is_leader() && cluster_active {
            for relation_id in self.credentials.scoped_relation_ids().await? {
                if relation_ids.contains(&relation_id) {
                    continue;
                }
                info!(relation_id, "Relation is gone, revoking its credential");
                if let Err(e) = self.relation_broken(relation_id, leadership).await {
                    warn!(relation_id, error = %e, "Failed to revoke orphaned credential");
                    first_error.get_or_insert(e);
                }
            }
        }

        for relation_id in relation_ids {
            match self
                .handle_request(relation_id, leadership, cluster_active)
                .await
            {
                Ok(outcome) => outcomes.push((relation_id, outcome)),
                Err(e) => {
                    warn!(relation_id, error = %e, "Database request failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Revoke the relation's user; only the leader acts
    #[instrument(skip(self))]
    pub async fn relation_broken(&self, relation_id: u32, leadership: Leadership) -> Result<bool> {
        if !leadership.is_leader() {
            return Ok(false);
        }
        let credentials = self.credentials.clone();
        let admin = self.admin.clone();
        self.retry
            .run("revoke-scoped-user", move || {
                let credentials = credentials.clone();
                let admin = admin.clone();
                async move { credentials.revoke(relation_id, admin.as_ref()).await }
            })
            .await
    }
}
