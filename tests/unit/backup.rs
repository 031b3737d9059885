//! Backups to object storage and restores from them

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use object_store::ObjectStore;
use tokio::sync::oneshot;

use mysql_operator::backup::{
    BackupKind, BackupLayout, BackupManifest, BackupStatus, RestoreOutcome,
};
use mysql_operator::controller::{Error, ErrorKind, Severity, concerns, handle_event};
use mysql_operator::leadership::Leadership;
use mysql_operator::{Context, UnitEvent};

use crate::common::*;

const S3_RELATION: u32 = 20;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

/// Leader with an initialized single-member cluster and a bucket related
async fn backed_deployment() -> (TestDeployment, Context) {
    let deployment = TestDeployment::new();
    let leader = deployment.unit(0, Leadership::Leader);
    handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();
    deployment.relate_s3(S3_RELATION).await;
    (deployment, leader)
}

async fn data_object(deployment: &TestDeployment, backup_id: &str) -> Vec<u8> {
    deployment
        .storage
        .inner()
        .get(&BackupLayout::new("mysql").data(backup_id))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap()
        .to_vec()
}

async fn request_restore(
    ctx: &Context,
    backup_id: &str,
    force: bool,
) -> mysql_operator::Result<RestoreOutcome> {
    let (tx, rx) = oneshot::channel();
    handle_event(
        ctx,
        UnitEvent::RestoreRequested {
            backup_id: backup_id.to_string(),
            force,
            reply: Some(tx),
        },
    )
    .await
    .unwrap();
    rx.await.unwrap()
}

mod backup_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_backup_uploads_data_and_manifest() {
        let (deployment, leader) = backed_deployment().await;

        let (tx, rx) = oneshot::channel();
        handle_event(
            &leader,
            UnitEvent::BackupRequested {
                kind: BackupKind::Full,
                reply: Some(tx),
            },
        )
        .await
        .unwrap();
        let manifest = rx.await.unwrap().unwrap();

        assert_eq!(manifest.status, BackupStatus::Complete);
        assert_eq!(manifest.kind, BackupKind::Full);
        assert_eq!(manifest.source_unit, unit_name(0));
        assert!(manifest.base_backup_id.is_none());
        let payload = backup_payload(&manifest.backup_id);
        assert_eq!(manifest.size_bytes, payload.len() as u64);
        assert_eq!(data_object(&deployment, &manifest.backup_id).await, payload);

        let condition = leader.status.condition(concerns::BACKUP).await.unwrap();
        assert_eq!(condition.reason, "BackedUp");
        // The lock is released afterwards
        assert!(deployment.record().await.backup_lock.is_none());
    }

    #[tokio::test]
    async fn test_backup_needs_initialized_cluster() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        deployment.relate_s3(S3_RELATION).await;

        let (tx, rx) = oneshot::channel();
        handle_event(
            &leader,
            UnitEvent::BackupRequested {
                kind: BackupKind::Full,
                reply: Some(tx),
            },
        )
        .await
        .unwrap();
        let err = rx.await.unwrap().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PreconditionNotMet);
        assert_eq!(deployment.admin.count("backup_to"), 0);
    }

    #[tokio::test]
    async fn test_backup_needs_object_storage() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();

        let err = leader
            .backups
            .backup(BackupKind::Full, true, at(0))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PreconditionNotMet);
        assert_eq!(deployment.admin.count("backup_to"), 0);
    }

    #[tokio::test]
    async fn test_incremental_needs_complete_base() {
        let (deployment, leader) = backed_deployment().await;

        let err = leader
            .backups
            .backup(BackupKind::Incremental, true, at(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataConflict);
        assert_eq!(deployment.admin.count("backup_to"), 0);

        let full = leader
            .backups
            .backup(BackupKind::Full, true, at(1))
            .await
            .unwrap();
        let incremental = leader
            .backups
            .backup(BackupKind::Incremental, true, at(2))
            .await
            .unwrap();
        assert_eq!(incremental.kind, BackupKind::Incremental);
        assert_eq!(incremental.base_backup_id, Some(full.backup_id));
    }

    #[tokio::test]
    async fn test_backups_listed_newest_first() {
        let (_deployment, leader) = backed_deployment().await;
        for minute in [5, 1, 3] {
            leader
                .backups
                .backup(BackupKind::Full, true, at(minute))
                .await
                .unwrap();
        }

        let (tx, rx) = oneshot::channel();
        handle_event(&leader, UnitEvent::ListBackupsRequested { reply: tx })
            .await
            .unwrap();
        let listed: Vec<BackupManifest> = rx.await.unwrap().unwrap();

        let created: Vec<DateTime<Utc>> = listed.iter().map(|m| m.created_at).collect();
        assert_eq!(created, vec![at(5), at(3), at(1)]);
    }

    #[tokio::test]
    async fn test_backup_refused_while_lock_held() {
        let (deployment, leader) = backed_deployment().await;
        let other = deployment.unit(1, Leadership::Follower);
        other
            .peers
            .acquire_lock("restore", at(0), Duration::from_secs(3600))
            .await
            .unwrap();

        let err = leader
            .backups
            .backup(BackupKind::Full, true, at(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockHeld { ref operation, .. } if operation == "restore"));
        assert_eq!(deployment.admin.count("backup_to"), 0);

        // Reclaimed once stale
        let later = at(0) + chrono::Duration::hours(3);
        leader
            .backups
            .backup(BackupKind::Full, true, later)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broken_stream_marks_backup_failed() {
        let (deployment, leader) = backed_deployment().await;
        deployment.admin.break_backup_stream();

        let err = leader
            .backups
            .backup(BackupKind::Full, true, at(4))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientInfra);
        let listed = leader.backups.list_backups().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, BackupStatus::Failed);
        assert!(deployment.record().await.backup_lock.is_none());

        // A failed backup is no base for an incremental
        let err = leader
            .backups
            .backup(BackupKind::Incremental, true, at(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataConflict);
    }

    #[tokio::test]
    async fn test_concurrent_backups_on_two_units() {
        let (deployment, leader) = backed_deployment().await;
        let other = deployment.unit(1, Leadership::Follower);
        let gate = deployment.admin.gate_backup_stream();

        let first = leader.backups.backup(BackupKind::Full, true, at(8));
        let second = async {
            while deployment.record().await.backup_lock.is_none() {
                tokio::task::yield_now().await;
            }
            let result = other.backups.backup(BackupKind::Full, true, at(9)).await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        let manifest = first.unwrap();
        assert!(matches!(
            second,
            Err(Error::LockHeld { ref operation, .. }) if operation == "backup"
        ));
        let listed = leader.backups.list_backups().await.unwrap();
        assert_eq!(listed, vec![manifest]);
        assert_eq!(listed[0].status, BackupStatus::Complete);
        assert_eq!(deployment.admin.count("backup_to"), 1);
        assert!(deployment.record().await.backup_lock.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_backup_id_refused() {
        let (deployment, leader) = backed_deployment().await;
        let first = leader
            .backups
            .backup(BackupKind::Full, true, at(7))
            .await
            .unwrap();

        let err = leader
            .backups
            .backup(BackupKind::Full, true, at(7))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        assert_eq!(deployment.admin.count("backup_to"), 1);
        let listed = leader.backups.list_backups().await.unwrap();
        assert_eq!(listed, vec![first]);
    }
}

mod restore_tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_refused_on_non_empty_data_dir() {
        let (deployment, leader) = backed_deployment().await;
        let full = leader
            .backups
            .backup(BackupKind::Full, true, at(0))
            .await
            .unwrap();
        deployment.admin.set_data_dir_empty(false);
        let topology = deployment.admin.topology();
        let record = deployment.record().await;

        let err = request_restore(&leader, &full.backup_id, false)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        assert_eq!(deployment.admin.topology(), topology);
        let after = deployment.record().await;
        assert!(!after.is_restoring());
        assert!(after.backup_lock.is_none());
        assert_eq!(after.members, record.members);
        assert_eq!(deployment.admin.count("restore_from"), 0);
    }

    #[tokio::test]
    async fn test_forced_restore_overwrites_data_dir() {
        let (deployment, leader) = backed_deployment().await;
        let full = leader
            .backups
            .backup(BackupKind::Full, true, at(0))
            .await
            .unwrap();
        deployment.admin.set_data_dir_empty(false);

        let outcome = request_restore(&leader, &full.backup_id, true).await.unwrap();

        assert_eq!(
            outcome,
            RestoreOutcome::Completed {
                backup_id: full.backup_id.clone()
            }
        );
        assert_eq!(deployment.admin.restored(), vec![backup_payload(&full.backup_id)]);
    }

    #[tokio::test]
    async fn test_single_unit_restore_completes_and_reinitializes() {
        let (deployment, leader) = backed_deployment().await;
        let full = leader
            .backups
            .backup(BackupKind::Full, true, at(0))
            .await
            .unwrap();
        let incremental = leader
            .backups
            .backup(BackupKind::Incremental, true, at(1))
            .await
            .unwrap();

        let outcome = request_restore(&leader, &incremental.backup_id, false)
            .await
            .unwrap();

        assert!(matches!(outcome, RestoreOutcome::Completed { .. }));
        // The chain is applied full backup first
        assert_eq!(
            deployment.admin.restored(),
            vec![
                backup_payload(&full.backup_id),
                backup_payload(&incremental.backup_id)
            ]
        );
        let record = deployment.record().await;
        assert!(!record.is_restoring());
        assert!(!record.cluster_initialized);
        assert!(record.backup_lock.is_none());

        handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();
        assert!(deployment.record().await.cluster_initialized);
    }

    #[tokio::test]
    async fn test_follower_cannot_restore() {
        let (deployment, leader) = backed_deployment().await;
        let full = leader
            .backups
            .backup(BackupKind::Full, true, at(0))
            .await
            .unwrap();
        let follower = deployment.unit(1, Leadership::Follower);

        let err = request_restore(&follower, &full.backup_id, true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotLeader));
        assert!(!deployment.record().await.is_restoring());
    }

    #[tokio::test]
    async fn test_unknown_backup_is_conflict() {
        let (deployment, leader) = backed_deployment().await;

        let err = request_restore(&leader, "1999-01-01T00-00-00Z", true)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        assert!(!deployment.record().await.is_restoring());
    }

    #[tokio::test]
    async fn test_multi_unit_restore_waits_for_scale_down() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let followers = [
            deployment.unit(1, Leadership::Follower),
            deployment.unit(2, Leadership::Follower),
        ];
        handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();
        for follower in &followers {
            handle_event(follower, UnitEvent::PeerChanged).await.unwrap();
        }
        handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();
        assert_eq!(deployment.admin.topology().len(), 3);

        deployment.relate_s3(S3_RELATION).await;
        let full = leader
            .backups
            .backup(BackupKind::Full, true, at(0))
            .await
            .unwrap();

        let outcome = request_restore(&leader, &full.backup_id, false)
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::Pending { .. }));
        assert!(deployment.record().await.is_restoring());
        assert_eq!(deployment.admin.count("restore_from"), 0);
        let condition = leader.status.condition(concerns::BACKUP).await.unwrap();
        assert_eq!(condition.severity, Severity::Waiting);
        assert_eq!(condition.reason, "RestorePending");

        // The next pass shrinks the cluster and streams the data in
        handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();

        assert_eq!(deployment.admin.count("remove_instance"), 2);
        assert_eq!(deployment.admin.restored(), vec![backup_payload(&full.backup_id)]);
        assert!(!deployment.record().await.is_restoring());
        let condition = leader.status.condition(concerns::BACKUP).await.unwrap();
        assert_eq!(condition.reason, "Restored");
    }
}
