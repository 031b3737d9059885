//! TLS material lifecycle
//!
//! A unit asks the certificate authority for a certificate over the
//! `certificates` relation, validates what comes back and installs the CA,
//! certificate and key into the engine data directory as one unit: the three
//! files are staged next to the live ones and renamed into place, and the
//! previous files come back if any rename or the engine reload fails.

pub mod bundle;
pub mod request;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::admin::ClusterAdmin;
use crate::constants::{TLS_SSL_CA_FILE, TLS_SSL_CERT_FILE, TLS_SSL_KEY_FILE};
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryPolicy;
use crate::store::{Databag, RelationEndpoint, RelationStore, SecretStore, unit_key};

pub use bundle::{CertificateBundle, digest_of};
pub use request::{PendingRequest, generate_request};

/// Unit databag key carrying our CSRs
pub const CSRS_KEY: &str = "certificate_signing_requests";
/// Remote databag key carrying issued certificates
pub const CERTIFICATES_KEY: &str = "certificates";

const PENDING_PREFIX: &str = "tls-pending";

/// Errors raised while handling TLS material
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("certificate not valid now (valid from {not_before} to {not_after})")]
    OutsideValidity {
        not_before: String,
        not_after: String,
    },

    #[error("certificate does not match the private key")]
    KeyMismatch,

    #[error("certificate is not signed by the CA: {0}")]
    UntrustedCertificate(String),

    #[error("issued certificate does not answer the pending request")]
    CsrMismatch,

    #[error("malformed certificates relation data: {0}")]
    Format(String),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    /// The material itself is unacceptable
    pub fn is_validation(&self) -> bool {
        !matches!(self, TlsError::Generation(_) | TlsError::Io(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TlsError::Io(_))
    }
}

/// One CSR entry in our unit databag
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CsrEntry {
    pub certificate_signing_request: String,
}

/// One issued certificate in the authority's databag
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub certificate_signing_request: String,
    pub certificate: String,
    pub ca: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

/// Issued certificates published on a relation
pub fn issued_certificates(remote: &Databag) -> std::result::Result<Vec<IssuedCertificate>, TlsError> {
    match remote.get(CERTIFICATES_KEY) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| TlsError::Format(e.to_string())),
        None => Ok(Vec::new()),
    }
}

/// Requests, validates and installs this unit's TLS material
#[derive(Clone)]
pub struct TlsManager {
    data_dir: PathBuf,
    unit: String,
    sans: Vec<String>,
    secrets: Arc<dyn SecretStore>,
    relations: Arc<dyn RelationStore>,
    admin: Arc<dyn ClusterAdmin>,
    retry: RetryPolicy,
}

impl TlsManager {
    pub fn new(
        data_dir: PathBuf,
        unit: &str,
        sans: Vec<String>,
        secrets: Arc<dyn SecretStore>,
        relations: Arc<dyn RelationStore>,
        admin: Arc<dyn ClusterAdmin>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            data_dir,
            unit: unit.to_string(),
            sans,
            secrets,
            relations,
            admin,
            retry,
        }
    }

    pub fn ca_path(&self) -> PathBuf {
        self.data_dir.join(TLS_SSL_CA_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join(TLS_SSL_CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(TLS_SSL_KEY_FILE)
    }

    fn pending_key(&self) -> String {
        unit_key(PENDING_PREFIX, &self.unit)
    }

    pub async fn pending_request(&self) -> Result<Option<PendingRequest>> {
        match self.secrets.get(&self.pending_key()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Publish a CSR on the relation, generating key and CSR on first use
    #[instrument(skip(self))]
    pub async fn request_certificate(&self, relation_id: u32) -> Result<PendingRequest> {
        let pending = match self.pending_request().await? {
            Some(pending) => pending,
            None => {
                let common_name = self.unit.replace('/', "-");
                let pending = generate_request(&common_name, &self.sans)?;
                self.secrets
                    .set(&self.pending_key(), &serde_json::to_string(&pending)?)
                    .await?;
                pending
            }
        };

        let entries = vec![CsrEntry {
            certificate_signing_request: pending.csr_pem.trim().to_string(),
        }];
        let mut data = self
            .relations
            .local_unit_data(RelationEndpoint::Certificates, relation_id)
            .await?;
        data.insert(CSRS_KEY.to_string(), serde_json::to_string(&entries)?);
        self.relations
            .set_local_unit_data(RelationEndpoint::Certificates, relation_id, data)
            .await?;
        info!(relation_id, "Published certificate signing request");
        Ok(pending)
    }

    /// Validate and install the certificate issued for our pending request.
    ///
    /// Returns the digest of the installed bundle, or `None` when nothing was
    /// issued for us yet. Invalid material is discarded without touching the
    /// installed files.
    #[instrument(skip(self))]
    pub async fn on_cert_issued(&self, relation_id: u32, now: DateTime<Utc>) -> Result<Option<String>> {
        let Some(pending) = self.pending_request().await? else {
            debug!(relation_id, "No pending certificate request");
            return Ok(None);
        };
        let remote = self
            .relations
            .remote_data(RelationEndpoint::Certificates, relation_id)
            .await?;
        let issued = issued_certificates(&remote)?;
        if issued.is_empty() {
            return Ok(None);
        }
        let certificate = issued
            .into_iter()
            .find(|c| pending.matches(&c.certificate_signing_request))
            .ok_or(TlsError::CsrMismatch)?;

        let bundle = CertificateBundle::validate(
            &certificate.ca,
            &certificate.certificate,
            &pending.key_pem,
            certificate.chain,
            now,
        )
        .inspect_err(|e| warn!(relation_id, error = %e, "Discarding issued certificate"))?;

        let digest = bundle.digest();
        if self.installed_digest().await?.as_deref() == Some(digest.as_str()) {
            debug!(%digest, "Bundle already installed");
            return Ok(Some(digest));
        }

        self.install(&bundle).await?;
        info!(%digest, sans = ?bundle.issued_for, "Installed TLS bundle");
        Ok(Some(digest))
    }

    /// Digest of the installed files, `None` unless all three exist
    pub async fn installed_digest(&self) -> Result<Option<String>> {
        let mut contents = Vec::with_capacity(3);
        for path in [self.ca_path(), self.cert_path(), self.key_path()] {
            match fs::read_to_string(&path).await {
                Ok(content) => contents.push(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(TlsError::Io(e).into()),
            }
        }
        Ok(Some(digest_of(&contents[0], &contents[1], &contents[2])))
    }

    /// Swap the bundle in and reload the engine; the previous files come back
    /// on any failure
    pub async fn install(&self, bundle: &CertificateBundle) -> Result<()> {
        let files = [
            (self.ca_path(), bundle.ca.as_str()),
            (self.cert_path(), bundle.server_cert.as_str()),
            (self.key_path(), bundle.server_key.as_str()),
        ];
        let swap = Swap::stage_and_swap(&files).await?;

        let reloaded = self.reload().await;
        match reloaded {
            Ok(()) => {
                swap.commit().await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Engine did not reload TLS, restoring previous files");
                swap.rollback().await;
                Err(e)
            }
        }
    }

    async fn reload(&self) -> Result<()> {
        let admin = self.admin.clone();
        self.retry
            .run("reload-tls", move || {
                let admin = admin.clone();
                async move { admin.reload_tls().await.map_err(Error::from) }
            })
            .await
    }

    /// Drop the custom material so the engine falls back to its own.
    ///
    /// Returns whether anything was removed.
    #[instrument(skip(self))]
    pub async fn revert(&self) -> Result<bool> {
        let mut removed = false;
        for path in [self.ca_path(), self.cert_path(), self.key_path()] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TlsError::Io(e).into()),
            }
        }
        self.secrets.remove(&self.pending_key()).await?;
        if removed {
            self.reload().await?;
            info!("Reverted to the engine's own TLS material");
        }
        Ok(removed)
    }
}

/// Files swapped into place, with the files they replaced
struct Swap {
    installed: Vec<(PathBuf, Option<PathBuf>)>,
}

impl Swap {
    async fn stage_and_swap(files: &[(PathBuf, &str)]) -> std::result::Result<Self, TlsError> {
        let mut staged = Vec::with_capacity(files.len());
        for (path, content) in files {
            let tmp = sibling(path, "staged");
            if let Err(e) = write_private(&tmp, content).await {
                remove_quietly(staged.iter().map(|(_, tmp)| tmp)).await;
                remove_quietly([&tmp]).await;
                return Err(e.into());
            }
            staged.push((path.clone(), tmp));
        }

        let mut swap = Swap {
            installed: Vec::with_capacity(files.len()),
        };
        let mut pending = staged.into_iter();
        while let Some((path, tmp)) = pending.next() {
            if let Err(e) = swap.swap_one(&path, &tmp).await {
                let rest: Vec<PathBuf> = pending.map(|(_, tmp)| tmp).collect();
                remove_quietly(rest.iter().chain([&tmp])).await;
                swap.rollback().await;
                return Err(e.into());
            }
        }
        Ok(swap)
    }

    async fn swap_one(&mut self, path: &Path, tmp: &Path) -> std::io::Result<()> {
        let backup = if fs::try_exists(path).await? {
            let backup = sibling(path, "previous");
            fs::rename(path, &backup).await?;
            Some(backup)
        } else {
            None
        };
        if let Err(e) = fs::rename(tmp, path).await {
            if let Some(backup) = &backup {
                let _ = fs::rename(backup, path).await;
            }
            return Err(e);
        }
        self.installed.push((path.to_path_buf(), backup));
        Ok(())
    }

    async fn commit(self) {
        remove_quietly(self.installed.iter().filter_map(|(_, b)| b.as_ref())).await;
    }

    async fn rollback(self) {
        for (path, backup) in self.installed.into_iter().rev() {
            let restored = match &backup {
                Some(backup) => fs::rename(backup, &path).await,
                None => fs::remove_file(&path).await,
            };
            if let Err(e) = restored {
                warn!(path = %path.display(), error = %e, "Failed to restore TLS file");
            }
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

async fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, format!("{}\n", content.trim())).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

fn remove_quietly<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> impl Future<Output = ()> + Send + 'a {
    let paths: Vec<&'a PathBuf> = paths.into_iter().collect();
    remove_all(paths)
}

async fn remove_all(paths: Vec<&PathBuf>) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}
