//! Cluster admin client boundary
//!
//! Every cluster-mutating or cluster-inspecting call goes through
//! [`ClusterAdmin`]. The production implementation drives `mysqlsh` and
//! `xtrabackup` inside the unit's pod; tests use an in-memory fake.

pub mod mysqlsh;
pub mod sql;
pub mod topology;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use mysqlsh::MysqlShellAdmin;
pub use topology::{ClusterTopology, MemberRole, MemberStatus, UnitMember};

/// Errors returned by the admin client
#[derive(Error, Debug)]
pub enum AdminError {
    /// The engine or the admin transport is temporarily unavailable
    #[error("transient admin failure: {0}")]
    Transient(String),

    /// The admin command ran and reported an error
    #[error("admin command failed: {0}")]
    CommandFailed(String),

    /// The target instance cannot be reached
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    /// The status document has more than one online primary
    #[error("corrupted topology: {0}")]
    CorruptTopology(String),

    /// Output of the admin command could not be interpreted
    #[error("unexpected admin output: {0}")]
    Parse(String),

    /// Invalid argument rejected before reaching the engine
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdminError {
    /// Whether a retry of the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AdminError::Transient(_) | AdminError::Unreachable(_) | AdminError::Io(_) => true,
            AdminError::Kube(kube::Error::Api(api_err)) => {
                !(400..500).contains(&api_err.code) || api_err.code == 429
            }
            AdminError::Kube(_) => true,
            AdminError::CommandFailed(_)
            | AdminError::CorruptTopology(_)
            | AdminError::Parse(_)
            | AdminError::InvalidArgument(_) => false,
        }
    }
}

/// Stream of backup bytes flowing out of, or into, the engine
pub type ByteStream = BoxStream<'static, Result<Bytes, AdminError>>;

/// Database account handed to the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
}

/// Administrative interface of the database engine
///
/// Implementations must be safe to call repeatedly: the membership controller
/// re-derives operations every pass and relies on skip-if-already-done
/// semantics at this boundary only for `configure_instance` and
/// `create_scoped_user`.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Bootstrap a new cluster on the given unit's instance
    async fn create_cluster(
        &self,
        cluster_name: &str,
        unit: &str,
        address: &str,
    ) -> Result<(), AdminError>;

    /// Join an instance to the existing cluster
    async fn add_instance(
        &self,
        cluster_name: &str,
        unit: &str,
        address: &str,
    ) -> Result<(), AdminError>;

    /// Remove an instance; `force` drops it even if it cannot be contacted
    async fn remove_instance(
        &self,
        cluster_name: &str,
        address: &str,
        force: bool,
    ) -> Result<(), AdminError>;

    /// Live cluster topology, `None` when no cluster exists
    async fn cluster_status(&self, cluster_name: &str)
    -> Result<Option<ClusterTopology>, AdminError>;

    /// Promote the best online secondary. Ranking is the engine's decision.
    async fn elect_primary(&self, cluster_name: &str) -> Result<(), AdminError>;

    /// Prepare the local instance for clustering and create the system accounts
    async fn configure_instance(&self, accounts: &[AdminAccount]) -> Result<(), AdminError>;

    /// Create `database` if absent and a user with privileges on it only
    async fn create_scoped_user(
        &self,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AdminError>;

    /// Drop a scoped user; missing users are not an error
    async fn drop_scoped_user(&self, username: &str) -> Result<(), AdminError>;

    /// Change the password of an existing user
    async fn set_password(&self, username: &str, password: &str) -> Result<(), AdminError>;

    /// Engine version string (e.g. `8.0.29-0ubuntu0.20.04.3`)
    async fn server_version(&self) -> Result<String, AdminError>;

    /// Whether the engine data directory holds no user data
    async fn data_dir_empty(&self) -> Result<bool, AdminError>;

    /// Stream a physical backup of the local instance.
    ///
    /// `incremental_base` names the backup an incremental is taken against.
    async fn backup_to(
        &self,
        backup_id: &str,
        incremental_base: Option<&str>,
    ) -> Result<ByteStream, AdminError>;

    /// Replace the local data directory with a backup chain.
    ///
    /// `chain` holds the full backup first, then each incremental in order.
    async fn restore_from(&self, chain: Vec<ByteStream>) -> Result<(), AdminError>;

    /// Make the engine pick up TLS material from the data directory
    async fn reload_tls(&self) -> Result<(), AdminError>;
}
