//! Backup and restore against object storage
//!
//! Backups and restores share the advisory `backup-lock`, so at most one of
//! them runs across the deployment. A restore is a multi-pass operation: the
//! leader writes `restore-in-progress`, the membership controller shrinks the
//! cluster to the restoring unit, and [`BackupOrchestrator::continue_restore`]
//! streams the data in once that unit is alone.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tracing::{debug, info, instrument, warn};

use super::manifest::{BackupKind, BackupLayout, BackupManifest, BackupStatus, RestoreOutcome};
use super::storage::ObjectStoreProvider;
use crate::admin::{AdminError, ByteStream, ClusterAdmin, ClusterTopology};
use crate::constants::BACKUP_CHUNK_SIZE;
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryPolicy;
use crate::leadership::LeadershipState;
use crate::peer::{PeerState, RestoreMarker, TopologyUpdate};
use crate::relations::S3Parameters;
use crate::store::RelationStore;

pub const BACKUP_OPERATION: &str = "backup";
pub const RESTORE_OPERATION: &str = "restore";

/// Upload parts buffered before the stream waits for the store
const MAX_IN_FLIGHT_PARTS: usize = 4;

/// Longest incremental chain followed back to its full backup
const MAX_CHAIN_LENGTH: usize = 64;

/// Bucket and layout resolved from the integrator relation
struct Target {
    store: Arc<dyn ObjectStore>,
    layout: BackupLayout,
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    unit: String,
    peers: PeerState,
    relations: Arc<dyn RelationStore>,
    admin: Arc<dyn ClusterAdmin>,
    storage: Arc<dyn ObjectStoreProvider>,
    retry: RetryPolicy,
    lock_staleness: Duration,
}

impl BackupOrchestrator {
    pub fn new(
        peers: PeerState,
        relations: Arc<dyn RelationStore>,
        admin: Arc<dyn ClusterAdmin>,
        storage: Arc<dyn ObjectStoreProvider>,
        retry: RetryPolicy,
        lock_staleness: Duration,
    ) -> Self {
        Self {
            unit: peers.unit().to_string(),
            peers,
            relations,
            admin,
            storage,
            retry,
            lock_staleness,
        }
    }

    async fn target(&self) -> Result<Target> {
        let params = S3Parameters::fetch(self.relations.as_ref())
            .await?
            .ok_or_else(|| {
                Error::PreconditionNotMet("no s3-parameters relation established".to_string())
            })?;
        Ok(Target {
            store: self.storage.store(&params)?,
            layout: BackupLayout::new(&params.path),
        })
    }

    /// Object storage parameters are present and usable
    pub async fn check_target(&self) -> Result<()> {
        self.target().await.map(|_| ())
    }

    /// Every readable manifest, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        let target = self.target().await?;
        list_manifests(&target).await
    }

    /// Take a backup of this unit's instance.
    ///
    /// Incremental backups are taken against the newest complete backup.
    #[instrument(skip(self))]
    pub async fn backup(
        &self,
        kind: BackupKind,
        cluster_active: bool,
        now: DateTime<Utc>,
    ) -> Result<BackupManifest> {
        if !cluster_active {
            return Err(Error::PreconditionNotMet(
                "backups need an initialized cluster".to_string(),
            ));
        }
        let target = self.target().await?;
        let base = match kind {
            BackupKind::Full => None,
            BackupKind::Incremental => {
                let base = list_manifests(&target)
                    .await?
                    .into_iter()
                    .find(BackupManifest::is_complete)
                    .ok_or_else(|| {
                        Error::DataConflict(
                            "incremental backup needs a complete base backup".to_string(),
                        )
                    })?;
                Some(base.backup_id)
            }
        };

        let lock = self
            .peers
            .acquire_lock(BACKUP_OPERATION, now, self.lock_staleness)
            .await?;
        let result = self.stream_backup(&target, kind, base, now).await;
        if let Err(e) = self.peers.release_lock(&lock).await {
            warn!(error = %e, "Failed to release backup lock");
        }
        result
    }

    async fn stream_backup(
        &self,
        target: &Target,
        kind: BackupKind,
        base: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<BackupManifest> {
        let mut manifest = BackupManifest::start(&self.unit, kind, base, now);
        if read_manifest(target, &manifest.backup_id).await?.is_some() {
            return Err(Error::DataConflict(format!(
                "backup {} already exists",
                manifest.backup_id
            )));
        }
        write_manifest(target, &manifest).await?;
        info!(backup_id = %manifest.backup_id, %kind, "Backup started");

        match self.upload(target, &manifest).await {
            Ok(size_bytes) => {
                manifest.size_bytes = size_bytes;
                manifest.status = BackupStatus::Complete;
                write_manifest(target, &manifest).await?;
                info!(backup_id = %manifest.backup_id, size_bytes, "Backup complete");
                Ok(manifest)
            }
            Err(e) => {
                manifest.status = BackupStatus::Failed;
                if let Err(write_err) = write_manifest(target, &manifest).await {
                    warn!(
                        backup_id = %manifest.backup_id,
                        error = %write_err,
                        "Failed to mark backup as failed"
                    );
                }
                warn!(backup_id = %manifest.backup_id, error = %e, "Backup failed");
                Err(e)
            }
        }
    }

    /// Stream the engine's backup into a multipart upload; returns its size
    async fn upload(&self, target: &Target, manifest: &BackupManifest) -> Result<u64> {
        let admin = self.admin.clone();
        let backup_id = manifest.backup_id.clone();
        let base = manifest.base_backup_id.clone();
        let mut stream = self
            .retry
            .run("backup-to", move || {
                let admin = admin.clone();
                let backup_id = backup_id.clone();
                let base = base.clone();
                async move {
                    admin
                        .backup_to(&backup_id, base.as_deref())
                        .await
                        .map_err(Error::from)
                }
            })
            .await?;

        let upload = target
            .store
            .put_multipart(&target.layout.data(&manifest.backup_id))
            .await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, BACKUP_CHUNK_SIZE);
        let mut size_bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => match writer.wait_for_capacity(MAX_IN_FLIGHT_PARTS).await {
                    Ok(()) => {
                        size_bytes += chunk.len() as u64;
                        writer.write(&chunk);
                        Ok(())
                    }
                    Err(e) => Err(Error::from(e)),
                },
                Err(e) => Err(Error::from(e)),
            };
            if let Err(e) = written {
                if let Err(abort_err) = writer.abort().await {
                    warn!(error = %abort_err, "Failed to abort backup upload");
                }
                return Err(e);
            }
        }

        writer.finish().await?;
        Ok(size_bytes)
    }

    /// Start restoring `backup_id` onto this unit's instance. Leader only.
    ///
    /// Refused with a data conflict when the data directory holds data and
    /// `force` is not set; nothing is changed in that case.
    #[instrument(skip(self, leadership, live))]
    pub async fn restore(
        &self,
        backup_id: &str,
        force: bool,
        leadership: &LeadershipState,
        live: Option<&ClusterTopology>,
        now: DateTime<Utc>,
    ) -> Result<RestoreOutcome> {
        let token = leadership.token().ok_or(Error::NotLeader)?;

        let record = self.peers.read().await?;
        if let Some(marker) = &record.restore {
            if marker.backup_id == backup_id && marker.unit == self.unit {
                return Ok(self
                    .continue_restore(leadership, live)
                    .await?
                    .unwrap_or_else(|| pending(backup_id, "restore already in progress")));
            }
            return Err(Error::DataConflict(format!(
                "restore of {} onto {} is already in progress",
                marker.backup_id, marker.unit
            )));
        }

        let target = self.target().await?;
        let manifest = read_manifest(&target, backup_id)
            .await?
            .ok_or_else(|| Error::DataConflict(format!("backup {} not found", backup_id)))?;
        if !manifest.is_complete() {
            return Err(Error::DataConflict(format!(
                "backup {} is not complete ({:?})",
                backup_id, manifest.status
            )));
        }
        resolve_chain(&target, &manifest).await?;

        if !force {
            let admin = self.admin.clone();
            let empty = self
                .retry
                .run("data-dir-empty", move || {
                    let admin = admin.clone();
                    async move { admin.data_dir_empty().await.map_err(Error::from) }
                })
                .await?;
            if !empty {
                return Err(Error::DataConflict(
                    "data directory is not empty; restore with force to overwrite it".to_string(),
                ));
            }
        }

        let lock = self
            .peers
            .acquire_lock(RESTORE_OPERATION, now, self.lock_staleness)
            .await?;
        let marker = RestoreMarker {
            backup_id: backup_id.to_string(),
            unit: self.unit.clone(),
            started_at: now,
        };
        if let Err(e) = self
            .peers
            .update_topology(&token, &[TopologyUpdate::RestoreStarted(marker)])
            .await
        {
            if let Err(release_err) = self.peers.release_lock(&lock).await {
                warn!(error = %release_err, "Failed to release restore lock");
            }
            return Err(e);
        }
        info!(backup_id, force, "Restore started");

        Ok(self
            .continue_restore(leadership, live)
            .await?
            .unwrap_or_else(|| pending(backup_id, "waiting for the restore to be picked up")))
    }

    /// Progress a started restore.
    ///
    /// `None` when no restore targets this unit. Once the cluster has shrunk
    /// to a single member the backup chain is streamed into the engine, the
    /// marker is cleared and the lock released; the next membership pass
    /// re-initializes the cluster.
    pub async fn continue_restore(
        &self,
        leadership: &LeadershipState,
        live: Option<&ClusterTopology>,
    ) -> Result<Option<RestoreOutcome>> {
        let record = self.peers.read().await?;
        let Some(marker) = record.restore.clone() else {
            return Ok(None);
        };
        if marker.unit != self.unit {
            return Ok(None);
        }
        let Some(token) = leadership.token() else {
            return Ok(Some(pending(&marker.backup_id, "waiting for leadership")));
        };

        let members = live.map_or(0, ClusterTopology::len);
        if members > 1 {
            debug!(members, "Restore waiting for scale-down");
            return Ok(Some(pending(
                &marker.backup_id,
                &format!("waiting for {} members to leave the cluster", members - 1),
            )));
        }

        let target = self.target().await?;
        let manifest = read_manifest(&target, &marker.backup_id)
            .await?
            .ok_or_else(|| {
                Error::DataConflict(format!("backup {} not found", marker.backup_id))
            })?;
        let chain = resolve_chain(&target, &manifest).await?;

        let mut streams: Vec<ByteStream> = Vec::with_capacity(chain.len());
        for backup in &chain {
            let object = target.store.get(&target.layout.data(&backup.backup_id)).await?;
            streams.push(
                object
                    .into_stream()
                    .map_err(|e| AdminError::Transient(e.to_string()))
                    .boxed(),
            );
        }
        self.admin.restore_from(streams).await?;

        self.peers
            .update_topology(&token, &[TopologyUpdate::RestoreFinished])
            .await?;
        if let Some(lock) = record
            .backup_lock
            .filter(|lock| lock.owner == self.unit && lock.operation == RESTORE_OPERATION)
        {
            self.peers.release_lock(&lock).await?;
        }
        info!(backup_id = %marker.backup_id, backups = chain.len(), "Restore complete");
        Ok(Some(RestoreOutcome::Completed {
            backup_id: marker.backup_id,
        }))
    }
}

fn pending(backup_id: &str, reason: &str) -> RestoreOutcome {
    RestoreOutcome::Pending {
        backup_id: backup_id.to_string(),
        reason: reason.to_string(),
    }
}

async fn list_manifests(target: &Target) -> Result<Vec<BackupManifest>> {
    let objects: Vec<_> = target
        .store
        .list(target.layout.root().as_ref())
        .try_collect()
        .await?;

    let mut manifests = Vec::new();
    for object in objects {
        if !BackupLayout::is_manifest(&object.location) {
            continue;
        }
        let bytes = target.store.get(&object.location).await?.bytes().await?;
        match serde_json::from_slice::<BackupManifest>(&bytes) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!(path = %object.location, error = %e, "Skipping unreadable manifest"),
        }
    }
    manifests.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.backup_id.cmp(&a.backup_id))
    });
    Ok(manifests)
}

async fn read_manifest(target: &Target, backup_id: &str) -> Result<Option<BackupManifest>> {
    match target.store.get(&target.layout.manifest(backup_id)).await {
        Ok(object) => Ok(Some(serde_json::from_slice(&object.bytes().await?)?)),
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_manifest(target: &Target, manifest: &BackupManifest) -> Result<()> {
    let body = Bytes::from(serde_json::to_vec_pretty(manifest)?);
    target
        .store
        .put(&target.layout.manifest(&manifest.backup_id), PutPayload::from(body))
        .await?;
    Ok(())
}

/// Full backup first, then each incremental up to `manifest`
async fn resolve_chain(target: &Target, manifest: &BackupManifest) -> Result<Vec<BackupManifest>> {
    let mut chain = vec![manifest.clone()];
    while let Some(base_id) = chain.last().and_then(|m| m.base_backup_id.clone()) {
        if chain.len() >= MAX_CHAIN_LENGTH || chain.iter().any(|m| m.backup_id == base_id) {
            return Err(Error::DataConflict(format!(
                "backup chain of {} does not end in a full backup",
                manifest.backup_id
            )));
        }
        let base = read_manifest(target, &base_id)
            .await?
            .filter(BackupManifest::is_complete)
            .ok_or_else(|| {
                Error::DataConflict(format!(
                    "base backup {} of {} is missing or incomplete",
                    base_id, manifest.backup_id
                ))
            })?;
        chain.push(base);
    }
    chain.reverse();
    Ok(chain)
}
