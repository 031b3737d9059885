//! Event handling for one unit
//!
//! Every [`UnitEvent`] ends up in [`handle_event`]. Most events run a full
//! pass over the unit: system credentials, own liveness, cluster membership,
//! restore continuation and database relations, in that order. Operator
//! actions answer on their reply channel instead of failing the event.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::admin::{ClusterTopology, MemberStatus};
use crate::backup::{BackupKind, BackupManifest, RestoreOutcome};
use crate::controller::context::Context;
use crate::controller::error::{Error, ErrorKind, Result};
use crate::controller::membership::{Executor, plan};
use crate::controller::status::{Severity, concerns};
use crate::credentials::{CredentialSet, SystemUser};
use crate::events::{Reply, UnitEvent};
use crate::leadership::Leadership;
use crate::peer::record::{ADDRESS, DEPARTING, HEARTBEAT, MEMBER_STATE, TLS_DIGEST};
use crate::peer::{MemberState, PeerRecord};
use crate::relations::RequestOutcome;
use crate::store::RelationEndpoint;

/// Handle one event to completion
#[instrument(skip(ctx, event), fields(event = event.name(), unit = %ctx.config.unit_name))]
pub async fn handle_event(ctx: &Context, event: UnitEvent) -> Result<()> {
    let started = Instant::now();
    let name = event.name();

    let result = dispatch(ctx, event).await;

    if let Some(metrics) = ctx.metrics() {
        metrics.record_event(name, started.elapsed().as_secs_f64());
        metrics.is_leader.set(i64::from(ctx.leadership.current().is_leader()));
        if let Err(e) = &result {
            metrics.record_error(name, error_kind_label(e.kind()));
        }
    }
    // A departed unit's entries are gone for good
    if !ctx.is_departing()
        && let Err(e) = ctx.status.publish(&ctx.peers, ctx.metrics()).await
    {
        debug!(error = %e, "Failed to publish unit status");
    }
    if result.is_ok()
        && let Some(health) = &ctx.health
    {
        health.touch();
    }
    result
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::TransientInfra => "transient",
        ErrorKind::PreconditionNotMet => "precondition",
        ErrorKind::DataConflict => "data-conflict",
        ErrorKind::Fatal => "fatal",
    }
}

async fn dispatch(ctx: &Context, event: UnitEvent) -> Result<()> {
    match event {
        UnitEvent::PeerChanged | UnitEvent::LeaderElected => reconcile_unit(ctx, false).await,
        UnitEvent::UpdateStatus => reconcile_unit(ctx, true).await,
        UnitEvent::LeadershipLost => {
            info!("Leadership lost, continuing read-only");
            publish_liveness(ctx, None, Utc::now(), false).await
        }
        UnitEvent::RelationChanged {
            endpoint,
            relation_id,
        } => relation_changed(ctx, endpoint, relation_id).await,
        UnitEvent::RelationBroken {
            endpoint,
            relation_id,
        } => relation_broken(ctx, endpoint, relation_id).await,
        UnitEvent::CertIssued { relation_id } => certificates_changed(ctx, relation_id).await,
        UnitEvent::Departing => {
            info!("Unit departing, asking the leader to remove it");
            ctx.mark_departing();
            ctx.peers
                .update_unit(&[(DEPARTING, Some("true".to_string()))])
                .await?;
            ctx.status
                .set(concerns::MEMBERSHIP, Severity::Waiting, "Departing", "leaving the cluster")
                .await;
            reconcile_unit(ctx, false).await
        }
        UnitEvent::BackupRequested { kind, reply } => respond(reply, run_backup(ctx, kind).await),
        UnitEvent::ListBackupsRequested { reply } => {
            respond(Some(reply), ctx.backups.list_backups().await)
        }
        UnitEvent::RestoreRequested {
            backup_id,
            force,
            reply,
        } => respond(reply, run_restore(ctx, &backup_id, force).await),
        UnitEvent::PasswordRotationRequested {
            user,
            password,
            reply,
        } => respond(reply, rotate_password(ctx, user, password).await),
        UnitEvent::ClusterStatusRequested { reply } => respond(Some(reply), fetch_live(ctx).await),
    }
}

/// Hand an action's outcome to whoever is waiting on it
fn respond<T>(reply: Option<Reply<T>>, result: Result<T>) -> Result<()> {
    match reply {
        Some(reply) => {
            if let Err(e) = &result {
                warn!(error = %e, "Action failed");
            }
            if reply.send(result).is_err() {
                debug!("Action caller went away before the reply");
            }
            Ok(())
        }
        None => result.map(|_| ()),
    }
}

/// Record `result`'s error on `concern` and pass it through
async fn surface<T>(ctx: &Context, concern: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        ctx.status.record_error(concern, e).await;
    }
    result
}

async fn ensure_not_halted(ctx: &Context) -> Result<()> {
    match ctx.status.halted().await {
        Some(reason) => Err(Error::Fatal(format!(
            "cluster mutations halted until restart: {}",
            reason
        ))),
        None => Ok(()),
    }
}

/// Live topology as seen through this unit's admin client
pub async fn fetch_live(ctx: &Context) -> Result<Option<ClusterTopology>> {
    let admin = ctx.admin.clone();
    let cluster_name = ctx.config.cluster_name.clone();
    ctx.config
        .retry
        .run("cluster-status", move || {
            let admin = admin.clone();
            let cluster_name = cluster_name.clone();
            async move { admin.cluster_status(&cluster_name).await.map_err(Error::from) }
        })
        .await
}

/// Full pass over the unit
async fn reconcile_unit(ctx: &Context, heartbeat: bool) -> Result<()> {
    let now = Utc::now();
    let leadership = ctx.leadership.current();

    let credentials = match ctx.credentials.ensure_system_credentials(leadership).await {
        Ok(credentials) => {
            ctx.status.clear(concerns::CREDENTIALS).await;
            Some(credentials)
        }
        Err(e) if e.is_deferrable() => {
            debug!(error = %e, "System credentials not available yet");
            ctx.status
                .set(
                    concerns::CREDENTIALS,
                    Severity::Waiting,
                    "AwaitingCredentials",
                    "waiting for the leader to generate system passwords",
                )
                .await;
            None
        }
        Err(e) => return surface(ctx, concerns::CREDENTIALS, Err(e)).await,
    };

    publish_liveness(ctx, credentials.as_ref(), now, heartbeat).await?;

    if let Some(reason) = ctx.status.halted().await {
        debug!(%reason, "Mutations halted, skipping reconciliation");
        return Ok(());
    }

    let live = match fetch_live(ctx).await {
        Ok(live) => live,
        Err(e) if !leadership.is_leader() => {
            debug!(error = %e, "Cluster status unavailable on follower");
            None
        }
        Err(e) => return surface(ctx, concerns::MEMBERSHIP, Err(e)).await,
    };

    let (record, live) = surface(
        ctx,
        concerns::MEMBERSHIP,
        reconcile_membership(ctx, leadership, live, now).await,
    )
    .await?;
    update_membership_status(ctx, &record, live.as_ref()).await;

    let restore = surface(
        ctx,
        concerns::BACKUP,
        ctx.backups.continue_restore(&ctx.leadership, live.as_ref()).await,
    )
    .await?;
    match restore {
        Some(RestoreOutcome::Completed { backup_id }) => {
            if let Some(metrics) = ctx.metrics() {
                metrics.record_backup("restore", true);
            }
            ctx.status
                .set(
                    concerns::BACKUP,
                    Severity::Active,
                    "Restored",
                    &format!("restored backup {}", backup_id),
                )
                .await;
            // The cluster is re-initialized by the pass this write triggers
            return Ok(());
        }
        Some(RestoreOutcome::Pending { backup_id, reason }) => {
            ctx.status
                .set(
                    concerns::BACKUP,
                    Severity::Waiting,
                    "RestorePending",
                    &format!("restore of {}: {}", backup_id, reason),
                )
                .await;
        }
        None => {}
    }

    let cluster_active = record.cluster_initialized && !record.is_restoring() && live.is_some();
    reconcile_databases(ctx, leadership, cluster_active).await
}

/// Publish this unit's address and readiness, configuring the instance first.
///
/// The heartbeat is refreshed when asked or when missing, so that regular
/// passes do not rewrite the peer key space and re-trigger themselves. A
/// departing unit publishes nothing: the leader drops its entries once it is
/// removed and they must stay gone.
async fn publish_liveness(
    ctx: &Context,
    credentials: Option<&CredentialSet>,
    now: DateTime<Utc>,
    heartbeat: bool,
) -> Result<()> {
    if ctx.is_departing() {
        return Ok(());
    }
    let record = ctx.peers.read().await?;
    let own = record.unit(&ctx.config.unit_name).cloned().unwrap_or_default();

    let mut entries: Vec<(&str, Option<String>)> =
        vec![(ADDRESS, Some(ctx.config.unit_address.clone()))];
    if heartbeat || own.heartbeat.is_none() {
        entries.push((HEARTBEAT, Some(now.to_rfc3339())));
    }

    if own.member_state != MemberState::Ready && !own.departing {
        let configured = match credentials {
            Some(credentials) if !record.is_restoring() => {
                let accounts = credentials.instance_accounts();
                let admin = ctx.admin.clone();
                let result = ctx
                    .config
                    .retry
                    .run("configure-instance", move || {
                        let admin = admin.clone();
                        let accounts = accounts.clone();
                        async move { admin.configure_instance(&accounts).await.map_err(Error::from) }
                    })
                    .await;
                match result {
                    Ok(()) => {
                        info!("Instance configured, announcing readiness");
                        ctx.status.clear(concerns::INSTANCE).await;
                        true
                    }
                    Err(e) => {
                        ctx.status.record_error(concerns::INSTANCE, &e).await;
                        false
                    }
                }
            }
            _ => false,
        };
        let state = if configured {
            MemberState::Ready
        } else {
            MemberState::Waiting
        };
        entries.push((MEMBER_STATE, Some(state.as_str().to_string())));
    }

    ctx.peers.update_unit(&entries).await?;
    Ok(())
}

/// Plan and execute one membership pass; returns the record and live
/// topology as they stand afterwards
async fn reconcile_membership(
    ctx: &Context,
    leadership: Leadership,
    live: Option<ClusterTopology>,
    now: DateTime<Utc>,
) -> Result<(PeerRecord, Option<ClusterTopology>)> {
    let record = ctx.peers.read().await?;
    let plan = plan(&record, live.as_ref(), leadership, &ctx.membership_policy(), now)?;
    if plan.is_empty() {
        record_membership_metrics(ctx, &record, live.as_ref());
        return Ok((record, live));
    }

    info!(
        state = %plan.state,
        operations = plan.operations.len(),
        peer_updates = plan.peer_updates.len(),
        "Executing membership plan"
    );
    let executor = Executor {
        admin: ctx.admin.clone(),
        peers: &ctx.peers,
        leadership: &ctx.leadership,
        retry: &ctx.config.retry,
        cluster_name: &ctx.config.cluster_name,
        metrics: ctx.metrics(),
    };
    let report = executor.execute(&plan).await?;
    if report.interrupted {
        info!(completed = report.completed.len(), "Membership pass interrupted");
    }

    let record = match report.record {
        Some(record) => record,
        None => ctx.peers.read().await?,
    };
    let live = if report.completed.is_empty() {
        live
    } else {
        fetch_live(ctx).await?
    };
    record_membership_metrics(ctx, &record, live.as_ref());
    Ok((record, live))
}

fn record_membership_metrics(ctx: &Context, record: &PeerRecord, live: Option<&ClusterTopology>) {
    let Some(metrics) = ctx.metrics() else {
        return;
    };
    metrics
        .units_added_to_cluster
        .set(i64::try_from(record.units_added_to_cluster).unwrap_or(i64::MAX));

    let statuses = [
        ("online", MemberStatus::Online),
        ("recovering", MemberStatus::Recovering),
        ("offline", MemberStatus::Offline),
        ("unreachable", MemberStatus::Unreachable),
        ("missing", MemberStatus::Missing),
    ];
    let counts: Vec<(&str, i64)> = statuses
        .iter()
        .map(|(label, status)| {
            let count = live.map_or(0, |topology| {
                topology.members().filter(|m| m.status == *status).count()
            });
            (*label, count as i64)
        })
        .collect();
    metrics.set_cluster_members(&counts);
}

async fn update_membership_status(
    ctx: &Context,
    record: &PeerRecord,
    live: Option<&ClusterTopology>,
) {
    let unit = &ctx.config.unit_name;
    let own = record.unit(unit);
    let member = live.and_then(|topology| topology.member(unit));

    let (severity, reason, message) = if own.is_some_and(|u| u.departing) {
        (Severity::Waiting, "Departing", "leaving the cluster".to_string())
    } else if let Some(marker) = &record.restore {
        (
            Severity::Waiting,
            "Restoring",
            format!("restoring backup {} onto {}", marker.backup_id, marker.unit),
        )
    } else if !record.cluster_initialized {
        (
            Severity::Waiting,
            "AwaitingInitialization",
            "waiting for the cluster to be initialized".to_string(),
        )
    } else {
        match member {
            Some(m) if m.is_online_primary() => (Severity::Active, "Primary", "Primary".to_string()),
            Some(m) if m.status == MemberStatus::Online => {
                (Severity::Active, "Secondary", "Secondary".to_string())
            }
            Some(m) => (
                Severity::Waiting,
                "Recovering",
                format!("member status {:?}", m.status).to_lowercase(),
            ),
            None => (
                Severity::Waiting,
                "Joining",
                "waiting to join the cluster".to_string(),
            ),
        }
    };
    ctx.status
        .set(concerns::MEMBERSHIP, severity, reason, &message)
        .await;
}

async fn reconcile_databases(ctx: &Context, leadership: Leadership, cluster_active: bool) -> Result<()> {
    let outcomes = surface(
        ctx,
        concerns::DATABASE,
        ctx.database.reconcile_all(leadership, cluster_active).await,
    )
    .await?;

    let deferred = outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, RequestOutcome::Deferred(_)))
        .count();
    if deferred > 0 && leadership.is_leader() {
        ctx.status
            .set(
                concerns::DATABASE,
                Severity::Waiting,
                "Deferred",
                &format!("{} database request(s) waiting for the cluster", deferred),
            )
            .await;
    } else {
        ctx.status.clear(concerns::DATABASE).await;
    }
    Ok(())
}

async fn relation_changed(ctx: &Context, endpoint: RelationEndpoint, relation_id: u32) -> Result<()> {
    match endpoint {
        RelationEndpoint::Database => reconcile_unit(ctx, false).await,
        RelationEndpoint::Certificates => certificates_changed(ctx, relation_id).await,
        RelationEndpoint::S3Parameters => {
            surface(ctx, concerns::S3, ctx.backups.check_target().await).await?;
            ctx.status.clear(concerns::S3).await;
            Ok(())
        }
    }
}

async fn relation_broken(ctx: &Context, endpoint: RelationEndpoint, relation_id: u32) -> Result<()> {
    match endpoint {
        RelationEndpoint::Database => {
            let revoked = surface(
                ctx,
                concerns::DATABASE,
                ctx.database
                    .relation_broken(relation_id, ctx.leadership.current())
                    .await,
            )
            .await?;
            debug!(relation_id, revoked, "Database relation removed");
            Ok(())
        }
        RelationEndpoint::Certificates => {
            surface(ctx, concerns::TLS, ctx.tls.revert().await).await?;
            ctx.peers.update_unit(&[(TLS_DIGEST, None)]).await?;
            ctx.status.clear(concerns::TLS).await;
            Ok(())
        }
        RelationEndpoint::S3Parameters => {
            ctx.status.clear(concerns::S3).await;
            Ok(())
        }
    }
}

/// Make sure our request is published, then pick up whatever was issued for it
async fn certificates_changed(ctx: &Context, relation_id: u32) -> Result<()> {
    surface(ctx, concerns::TLS, ctx.tls.request_certificate(relation_id).await).await?;
    install_certificate(ctx, relation_id).await
}

/// Validate and install an issued certificate; invalid material leaves the
/// installed bundle untouched and blocks the unit
async fn install_certificate(ctx: &Context, relation_id: u32) -> Result<()> {
    let installed = surface(
        ctx,
        concerns::TLS,
        ctx.tls.on_cert_issued(relation_id, Utc::now()).await,
    )
    .await?;
    match installed {
        Some(digest) => {
            ctx.peers
                .update_unit(&[(TLS_DIGEST, Some(digest))])
                .await?;
            ctx.status
                .set(concerns::TLS, Severity::Active, "Installed", "TLS enabled")
                .await;
        }
        None => {
            ctx.status
                .set(
                    concerns::TLS,
                    Severity::Waiting,
                    "AwaitingCertificate",
                    "waiting for the certificate authority",
                )
                .await;
        }
    }
    Ok(())
}

async fn run_backup(ctx: &Context, kind: BackupKind) -> Result<BackupManifest> {
    ensure_not_halted(ctx).await?;
    let record = ctx.peers.read().await?;
    let cluster_active = record.cluster_initialized && !record.is_restoring();

    let result = ctx.backups.backup(kind, cluster_active, Utc::now()).await;
    if let Some(metrics) = ctx.metrics() {
        metrics.record_backup("backup", result.is_ok());
    }
    match &result {
        Ok(manifest) => {
            ctx.status
                .set(
                    concerns::BACKUP,
                    Severity::Active,
                    "BackedUp",
                    &format!("last backup {}", manifest.backup_id),
                )
                .await;
        }
        Err(e) => ctx.status.record_error(concerns::BACKUP, e).await,
    }
    result
}

async fn run_restore(ctx: &Context, backup_id: &str, force: bool) -> Result<RestoreOutcome> {
    ensure_not_halted(ctx).await?;
    let live = fetch_live(ctx).await?;
    let outcome = ctx
        .backups
        .restore(backup_id, force, &ctx.leadership, live.as_ref(), Utc::now())
        .await?;
    match &outcome {
        RestoreOutcome::Completed { backup_id } => {
            if let Some(metrics) = ctx.metrics() {
                metrics.record_backup("restore", true);
            }
            info!(%backup_id, "Restore completed");
        }
        RestoreOutcome::Pending { backup_id, reason } => {
            ctx.status
                .set(
                    concerns::BACKUP,
                    Severity::Waiting,
                    "RestorePending",
                    &format!("restore of {}: {}", backup_id, reason),
                )
                .await;
        }
    }
    Ok(outcome)
}

async fn rotate_password(ctx: &Context, user: SystemUser, password: Option<String>) -> Result<()> {
    ensure_not_halted(ctx).await?;
    let token = ctx.leadership.token().ok_or(Error::NotLeader)?;
    let credentials = ctx.credentials.clone();
    let admin = ctx.admin.clone();
    let credential = ctx
        .config
        .retry
        .run("rotate-password", move || {
            let credentials = credentials.clone();
            let admin = admin.clone();
            let password = password.clone();
            async move {
                credentials
                    .rotate_system_password(&token, user, password, admin.as_ref())
                    .await
            }
        })
        .await?;
    info!(
        user = user.username(),
        rotation_epoch = credential.rotation_epoch,
        "Password rotated"
    );
    Ok(())
}
