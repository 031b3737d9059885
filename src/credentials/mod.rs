//! Credential lifecycle
//!
//! System accounts are generated once by the leader and read by every unit.
//! Scoped accounts belong to exactly one database relation and are destroyed
//! with it.

mod password;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::admin::{AdminAccount, ClusterAdmin};
use crate::constants::{
    CLUSTER_ADMIN_PASSWORD_KEY, CLUSTER_ADMIN_USERNAME, RELATION_USER_PREFIX, ROOT_PASSWORD_KEY,
    ROOT_USERNAME, SERVER_CONFIG_PASSWORD_KEY, SERVER_CONFIG_USERNAME,
};
use crate::controller::error::{Error, Result};
use crate::leadership::{LeaderToken, Leadership};
use crate::store::SecretStore;

pub use password::{generate_password, generate_password_of};

/// Fixed system accounts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemUser {
    /// Administrative superuser
    Root,
    /// Account used for cluster administration
    ClusterAdmin,
    /// Account used for server configuration and backups
    ServerConfig,
}

impl SystemUser {
    pub const ALL: [SystemUser; 3] = [
        SystemUser::Root,
        SystemUser::ClusterAdmin,
        SystemUser::ServerConfig,
    ];

    pub fn username(self) -> &'static str {
        match self {
            SystemUser::Root => ROOT_USERNAME,
            SystemUser::ClusterAdmin => CLUSTER_ADMIN_USERNAME,
            SystemUser::ServerConfig => SERVER_CONFIG_USERNAME,
        }
    }

    /// Secret store key of the password
    pub fn password_key(self) -> &'static str {
        match self {
            SystemUser::Root => ROOT_PASSWORD_KEY,
            SystemUser::ClusterAdmin => CLUSTER_ADMIN_PASSWORD_KEY,
            SystemUser::ServerConfig => SERVER_CONFIG_PASSWORD_KEY,
        }
    }

    fn epoch_key(self) -> String {
        format!("{}-epoch", self.password_key())
    }

    fn previous_key(self) -> String {
        format!("{}-previous", self.password_key())
    }

    /// Look a system user up by its database username
    pub fn from_username(username: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|user| user.username() == username)
    }
}

/// A system account and how many times its password was rotated
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub rotation_epoch: u64,
}

impl Credential {
    pub fn account(&self) -> AdminAccount {
        AdminAccount {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// All system accounts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSet {
    pub root: Credential,
    pub cluster_admin: Credential,
    pub server_config: Credential,
}

impl CredentialSet {
    pub fn get(&self, user: SystemUser) -> &Credential {
        match user {
            SystemUser::Root => &self.root,
            SystemUser::ClusterAdmin => &self.cluster_admin,
            SystemUser::ServerConfig => &self.server_config,
        }
    }

    /// Accounts every instance must have before joining the cluster
    pub fn instance_accounts(&self) -> Vec<AdminAccount> {
        vec![self.cluster_admin.account(), self.server_config.account()]
    }
}

/// Database account issued to one relation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedCredential {
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Username issued to a database relation
pub fn relation_username(relation_id: u32) -> String {
    format!("{}{}", RELATION_USER_PREFIX, relation_id)
}

/// Credential storage over the application secret store
#[derive(Clone)]
pub struct CredentialStore {
    secrets: Arc<dyn SecretStore>,
}

impl CredentialStore {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    async fn load(&self, user: SystemUser) -> Result<Option<Credential>> {
        let Some(password) = self.secrets.get(user.password_key()).await? else {
            return Ok(None);
        };
        let rotation_epoch = self
            .secrets
            .get(&user.epoch_key())
            .await?
            .and_then(|e| e.parse().ok())
            .unwrap_or(0);
        Ok(Some(Credential {
            username: user.username().to_string(),
            password,
            rotation_epoch,
        }))
    }

    /// Read every system credential; missing ones are a precondition failure
    pub async fn system_credentials(&self) -> Result<CredentialSet> {
        let mut loaded = Vec::with_capacity(SystemUser::ALL.len());
        for user in SystemUser::ALL {
            let credential = self.load(user).await?.ok_or_else(|| {
                Error::PreconditionNotMet(format!(
                    "{} password not yet generated by the leader",
                    user.username()
                ))
            })?;
            loaded.push(credential);
        }
        let mut loaded = loaded.into_iter();
        match (loaded.next(), loaded.next(), loaded.next()) {
            (Some(root), Some(cluster_admin), Some(server_config)) => Ok(CredentialSet {
                root,
                cluster_admin,
                server_config,
            }),
            _ => Err(Error::Fatal("system credential set incomplete".to_string())),
        }
    }

    /// Make sure every system credential exists.
    ///
    /// The leader generates whatever is missing and never overwrites an
    /// existing password; followers only read.
    #[instrument(skip(self))]
    pub async fn ensure_system_credentials(&self, leadership: Leadership) -> Result<CredentialSet> {
        if leadership.is_leader() {
            for user in SystemUser::ALL {
                if self.secrets.get(user.password_key()).await?.is_none() {
                    info!(user = user.username(), "Generating system password");
                    self.secrets
                        .set(user.password_key(), &generate_password())
                        .await?;
                }
            }
        }
        self.system_credentials().await
    }

    /// Credential previously issued to a relation
    pub async fn scoped_credential(&self, relation_id: u32) -> Result<Option<ScopedCredential>> {
        match self.secrets.get(&relation_username(relation_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Relations that currently hold a scoped credential
    pub async fn scoped_relation_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .secrets
            .keys()
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(RELATION_USER_PREFIX)?.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Issue a fresh credential scoped to `database`
    #[instrument(skip(self))]
    pub async fn issue_scoped_credential(
        &self,
        relation_id: u32,
        database: &str,
    ) -> Result<ScopedCredential> {
        if self.scoped_credential(relation_id).await?.is_some() {
            return Err(Error::AlreadyIssued { relation_id });
        }
        let credential = ScopedCredential {
            username: relation_username(relation_id),
            password: generate_password(),
            database: database.to_string(),
        };
        self.secrets
            .set(&credential.username, &serde_json::to_string(&credential)?)
            .await?;
        info!(username = %credential.username, database, "Issued scoped credential");
        Ok(credential)
    }

    /// Drop the relation's database user, then forget its credential.
    ///
    /// Returns `false` when there was nothing to revoke.
    #[instrument(skip(self, admin))]
    pub async fn revoke(&self, relation_id: u32, admin: &dyn ClusterAdmin) -> Result<bool> {
        let Some(credential) = self.scoped_credential(relation_id).await? else {
            return Ok(false);
        };
        admin.drop_scoped_user(&credential.username).await?;
        self.secrets.remove(&credential.username).await?;
        info!(username = %credential.username, "Revoked scoped credential");
        Ok(true)
    }

    /// Set a new password for a system user and bump its rotation epoch.
    ///
    /// The new password is persisted before the engine is changed and the
    /// previous one kept until the engine accepted it, so a failure at any
    /// step leaves a password that works.
    #[instrument(skip(self, _token, password, admin))]
    pub async fn rotate_system_password(
        &self,
        _token: &LeaderToken,
        user: SystemUser,
        password: Option<String>,
        admin: &dyn ClusterAdmin,
    ) -> Result<Credential> {
        let current = self.load(user).await?.ok_or_else(|| {
            Error::PreconditionNotMet(format!("{} password not generated yet", user.username()))
        })?;
        let password = password.unwrap_or_else(generate_password);
        if password.is_empty() {
            return Err(Error::InvalidConfig("password must not be empty".to_string()));
        }

        self.secrets
            .set(&user.previous_key(), &current.password)
            .await?;
        self.secrets.set(user.password_key(), &password).await?;

        if let Err(e) = admin.set_password(user.username(), &password).await {
            warn!(user = user.username(), error = %e, "Engine rejected new password, reverting");
            self.secrets
                .set(user.password_key(), &current.password)
                .await?;
            self.secrets.remove(&user.previous_key()).await?;
            return Err(e.into());
        }

        let rotation_epoch = current.rotation_epoch + 1;
        self.secrets
            .set(&user.epoch_key(), &rotation_epoch.to_string())
            .await?;
        self.secrets.remove(&user.previous_key()).await?;
        info!(user = user.username(), rotation_epoch, "Rotated system password");

        Ok(Credential {
            username: user.username().to_string(),
            password,
            rotation_epoch,
        })
    }
}
