//! Cluster membership reconciliation
//!
//! [`plan`] is pure: from the peer record and the live topology it decides
//! which admin operations to issue and which topology keys to rewrite. The
//! [`Executor`] then performs the operations one by one, re-checking
//! leadership before each, and commits the peer update attached to every
//! operation that succeeded. Running a second pass after an executed one
//! yields an empty plan.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::admin::{ClusterAdmin, ClusterTopology, MemberStatus, UnitMember};
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryPolicy;
use crate::controller::state_machine::{
    ClusterEvent, ClusterState, ClusterStateMachine, TransitionContext, TransitionResult,
    determine_event,
};
use crate::health::Metrics;
use crate::leadership::{Leadership, LeadershipState};
use crate::peer::{PeerRecord, PeerState, RestoreMarker, TopologyUpdate, UnitRecord};

/// Inputs of a pass that do not come from observed state
#[derive(Clone, Debug)]
pub struct MembershipPolicy {
    /// Unit running the pass
    pub unit: String,
    pub cluster_name: String,
    /// How long an absent member's heartbeat may be silent before removal
    pub departure_grace: Duration,
}

/// Cluster-mutating admin operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminOperation {
    CreateCluster { unit: String, address: String },
    AddInstance { unit: String, address: String },
    RemoveInstance {
        unit: String,
        address: String,
        force: bool,
    },
    ElectPrimary,
}

impl AdminOperation {
    /// Short name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            AdminOperation::CreateCluster { .. } => "create-cluster",
            AdminOperation::AddInstance { .. } => "add-instance",
            AdminOperation::RemoveInstance { .. } => "remove-instance",
            AdminOperation::ElectPrimary => "elect-primary",
        }
    }

    /// Unit the operation acts on
    pub fn unit(&self) -> Option<&str> {
        match self {
            AdminOperation::CreateCluster { unit, .. }
            | AdminOperation::AddInstance { unit, .. }
            | AdminOperation::RemoveInstance { unit, .. } => Some(unit),
            AdminOperation::ElectPrimary => None,
        }
    }
}

/// An operation and the peer update committed once it succeeded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedOperation {
    pub operation: AdminOperation,
    pub on_success: Option<TopologyUpdate>,
}

/// Outcome of planning one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// State the cluster is in once the plan is executed
    pub state: ClusterState,
    /// Removals first, then election, then additions
    pub operations: Vec<PlannedOperation>,
    /// Topology corrections needing no admin call, committed first
    pub peer_updates: Vec<TopologyUpdate>,
}

impl ReconcilePlan {
    fn idle(state: ClusterState) -> Self {
        Self {
            state,
            operations: Vec::new(),
            peer_updates: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.peer_updates.is_empty()
    }

    /// Operations in execution order
    pub fn admin_operations(&self) -> impl Iterator<Item = &AdminOperation> {
        self.operations.iter().map(|planned| &planned.operation)
    }

    fn push(&mut self, operation: AdminOperation, on_success: Option<TopologyUpdate>) {
        self.operations.push(PlannedOperation {
            operation,
            on_success,
        });
    }
}

/// State recorded in the peer key space
pub fn observed_state(record: &PeerRecord) -> ClusterState {
    if record.restore.is_some() {
        ClusterState::Restoring
    } else if record.cluster_initialized {
        ClusterState::Active
    } else {
        ClusterState::Uninitialized
    }
}

/// Why a live member is scheduled for removal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DepartureReason {
    /// The unit flagged itself as departing
    Departing,
    /// The unit's peer entries are gone
    Vanished,
    /// Absent from the cluster and silent beyond the grace period
    Stale,
}

fn departure_reason(
    record: &PeerRecord,
    member: &UnitMember,
    grace: Duration,
    now: DateTime<Utc>,
) -> Option<DepartureReason> {
    let Some(unit) = record.unit(&member.unit_id) else {
        return Some(DepartureReason::Vanished);
    };
    if unit.departing {
        return Some(DepartureReason::Departing);
    }
    if member.status.is_absent() && heartbeat_is_stale(unit, grace, now) {
        return Some(DepartureReason::Stale);
    }
    None
}

fn heartbeat_is_stale(unit: &UnitRecord, grace: Duration, now: DateTime<Utc>) -> bool {
    match unit.heartbeat {
        Some(beat) => now
            .signed_duration_since(beat)
            .to_std()
            .map(|age| age > grace)
            .unwrap_or(false),
        None => true,
    }
}

fn removal(member: &UnitMember) -> AdminOperation {
    AdminOperation::RemoveInstance {
        unit: member.unit_id.clone(),
        address: member.address.clone(),
        force: member.status != MemberStatus::Online,
    }
}

/// Decide the operations of one pass.
///
/// Followers always get an empty plan. Errors only for a corrupted topology
/// or an initialized cluster without a live one.
pub fn plan(
    record: &PeerRecord,
    live: Option<&ClusterTopology>,
    leadership: Leadership,
    policy: &MembershipPolicy,
    now: DateTime<Utc>,
) -> Result<ReconcilePlan> {
    let live = live.filter(|topology| !topology.is_empty());
    if let Some(topology) = live {
        topology.primary()?;
    }

    let state = observed_state(record);
    let ctx = TransitionContext::new(leadership.is_leader(), record.ready_units().count())
        .with_live_cluster(live.is_some())
        .with_restore_marker(record.restore.is_some());
    let event = determine_event(&state, &ctx);

    let mut plan = ReconcilePlan::idle(state);
    match ClusterStateMachine::new().transition(&state, event, &ctx) {
        TransitionResult::Success {
            from,
            to,
            event,
            description,
        } => {
            debug!(%from, %to, %event, description, "Membership transition");
            plan.state = to;
            match (event, &record.restore) {
                (ClusterEvent::ClusterAbsent, _) => bootstrap(record, policy, &mut plan),
                (ClusterEvent::LiveClusterFound, _) => {
                    if let Some(topology) = live {
                        adopt(topology, policy, &mut plan);
                    }
                }
                (ClusterEvent::RestoreRequested, Some(marker))
                | (ClusterEvent::MembershipDrift, Some(marker)) => {
                    scale_down(record, live, marker, &mut plan)
                }
                (ClusterEvent::MembershipDrift, None) => {
                    let topology = live.ok_or_else(|| {
                        Error::PreconditionNotMet(
                            "cluster recorded as initialized but none is reported live"
                                .to_string(),
                        )
                    })?;
                    converge(record, topology, policy, now, &mut plan)?;
                }
                _ => {}
            }
        }
        TransitionResult::GuardFailed { from, event, reason, .. } => {
            debug!(state = %from, %event, %reason, "Membership transition not taken");
        }
        TransitionResult::InvalidTransition { current, event } => {
            debug!(state = %current, %event, "No membership transition");
        }
    }
    Ok(plan)
}

/// Create the cluster on the leader's instance when it is ready, else on the
/// first ready unit, and join every other ready unit after it
fn bootstrap(record: &PeerRecord, policy: &MembershipPolicy, plan: &mut ReconcilePlan) {
    let own = record
        .unit(&policy.unit)
        .filter(|unit| unit.is_ready())
        .map(|unit| (&policy.unit, unit));
    let Some((seed, seed_record)) = own.or_else(|| record.ready_units().next()) else {
        return;
    };
    let Some(seed_address) = seed_record.address.clone() else {
        return;
    };

    plan.push(
        AdminOperation::CreateCluster {
            unit: seed.clone(),
            address: seed_address,
        },
        Some(TopologyUpdate::ClusterCreated {
            cluster_name: policy.cluster_name.clone(),
            unit: seed.clone(),
        }),
    );
    for (unit, unit_record) in record.ready_units() {
        if unit == seed {
            continue;
        }
        if let Some(address) = &unit_record.address {
            plan.push(
                AdminOperation::AddInstance {
                    unit: unit.clone(),
                    address: address.clone(),
                },
                Some(TopologyUpdate::MemberAdded { unit: unit.clone() }),
            );
        }
    }
}

fn adopt(topology: &ClusterTopology, policy: &MembershipPolicy, plan: &mut ReconcilePlan) {
    let members: BTreeSet<String> = topology.unit_ids().map(str::to_string).collect();
    info!(members = members.len(), "Adopting live cluster");
    plan.peer_updates.push(TopologyUpdate::Adopted {
        cluster_name: policy.cluster_name.clone(),
        members,
    });
}

/// Remove every member but the restoring unit. Never adds, never elects.
fn scale_down(
    record: &PeerRecord,
    live: Option<&ClusterTopology>,
    marker: &RestoreMarker,
    plan: &mut ReconcilePlan,
) {
    if let Some(topology) = live {
        let mut removals: Vec<&UnitMember> = topology
            .members()
            .filter(|member| member.unit_id != marker.unit)
            .collect();
        if removals.len() == topology.len() {
            // The restoring unit is not a member; leave one behind
            removals.sort_by_key(|member| member.is_online_primary());
            removals.pop();
        }
        // Secondaries before the primary
        removals.sort_by_key(|member| member.is_online_primary());
        for member in removals {
            plan.push(
                removal(member),
                Some(TopologyUpdate::MemberRemoved {
                    unit: member.unit_id.clone(),
                }),
            );
        }
    }

    for unit in &record.members {
        if *unit != marker.unit && !live.is_some_and(|topology| topology.contains(unit)) {
            plan.peer_updates.push(TopologyUpdate::MemberRemoved { unit: unit.clone() });
        }
    }
}

/// Converge the live membership of an active cluster toward the ready units
fn converge(
    record: &PeerRecord,
    topology: &ClusterTopology,
    policy: &MembershipPolicy,
    now: DateTime<Utc>,
    plan: &mut ReconcilePlan,
) -> Result<()> {
    let mut removals: Vec<(&UnitMember, DepartureReason)> = topology
        .members()
        .filter_map(|member| {
            departure_reason(record, member, policy.departure_grace, now)
                .map(|reason| (member, reason))
        })
        .collect();

    if !removals.is_empty() && removals.len() == topology.len() {
        // Keep the member most likely to hold current data
        removals.sort_by_key(|(member, _)| {
            (member.is_online_primary(), member.status == MemberStatus::Online)
        });
        if let Some((kept, _)) = removals.pop() {
            warn!(unit = %kept.unit_id, "Not removing the last cluster member");
        }
    }
    removals.sort_by_key(|(member, _)| member.is_online_primary());
    let removed: BTreeSet<&str> = removals
        .iter()
        .map(|(member, _)| member.unit_id.as_str())
        .collect();

    for (member, reason) in &removals {
        debug!(unit = %member.unit_id, ?reason, status = ?member.status, "Planning removal");
        plan.push(
            removal(member),
            Some(TopologyUpdate::MemberRemoved {
                unit: member.unit_id.clone(),
            }),
        );
    }

    // Failover: delegated to the engine's ranking
    let primary = topology.primary()?;
    let electable = topology
        .members()
        .any(|member| member.is_online_secondary() && !removed.contains(member.unit_id.as_str()));
    if primary.is_none() && electable {
        plan.push(AdminOperation::ElectPrimary, None);
    }

    for (unit, unit_record) in record.ready_units() {
        if topology.contains(unit) || removed.contains(unit.as_str()) {
            continue;
        }
        if let Some(address) = &unit_record.address {
            plan.push(
                AdminOperation::AddInstance {
                    unit: unit.clone(),
                    address: address.clone(),
                },
                Some(TopologyUpdate::MemberAdded { unit: unit.clone() }),
            );
        }
    }

    // Recorded membership drifts from live membership without admin calls
    for unit in topology.unit_ids() {
        if !removed.contains(unit) && !record.members.contains(unit) {
            plan.peer_updates.push(TopologyUpdate::MemberAdded {
                unit: unit.to_string(),
            });
        }
    }
    for unit in &record.members {
        let rejoining = record.unit(unit).is_some_and(UnitRecord::is_ready);
        if !topology.contains(unit) && !rejoining {
            plan.peer_updates.push(TopologyUpdate::MemberRemoved { unit: unit.clone() });
        }
    }
    Ok(())
}

/// What an executed plan achieved
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub completed: Vec<AdminOperation>,
    /// Leadership was lost before the plan finished
    pub interrupted: bool,
    /// Peer record after the last commit
    pub record: Option<PeerRecord>,
}

/// Performs planned operations for the leader
pub struct Executor<'a> {
    pub admin: Arc<dyn ClusterAdmin>,
    pub peers: &'a PeerState,
    pub leadership: &'a LeadershipState,
    pub retry: &'a RetryPolicy,
    pub cluster_name: &'a str,
    pub metrics: Option<&'a Metrics>,
}

impl Executor<'_> {
    /// Execute `plan`, stopping at the first failed operation
    pub async fn execute(&self, plan: &ReconcilePlan) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();

        if !plan.peer_updates.is_empty() {
            let Some(token) = self.leadership.token() else {
                report.interrupted = true;
                return Ok(report);
            };
            report.record = Some(self.peers.update_topology(&token, &plan.peer_updates).await?);
        }

        for planned in &plan.operations {
            let Some(token) = self.leadership.token() else {
                info!(
                    operation = planned.operation.name(),
                    "Leadership lost mid-pass, stopping"
                );
                report.interrupted = true;
                return Ok(report);
            };

            let admin = self.admin.clone();
            let cluster_name = self.cluster_name.to_string();
            let operation = planned.operation.clone();
            let result = self
                .retry
                .run(planned.operation.name(), move || {
                    perform(admin.clone(), cluster_name.clone(), operation.clone())
                })
                .await;
            if let Some(metrics) = self.metrics {
                metrics.record_admin_operation(planned.operation.name(), result.is_ok());
            }
            if let Err(e) = result {
                warn!(
                    operation = planned.operation.name(),
                    unit = planned.operation.unit().unwrap_or_default(),
                    error = %e,
                    "Admin operation failed"
                );
                return Err(e);
            }

            info!(
                operation = planned.operation.name(),
                unit = planned.operation.unit().unwrap_or_default(),
                "Admin operation completed"
            );
            if let Some(update) = &planned.on_success {
                report.record = Some(
                    self.peers
                        .update_topology(&token, std::slice::from_ref(update))
                        .await?,
                );
            }
            report.completed.push(planned.operation.clone());
        }
        Ok(report)
    }
}

async fn perform(
    admin: Arc<dyn ClusterAdmin>,
    cluster_name: String,
    operation: AdminOperation,
) -> Result<()> {
    match operation {
        AdminOperation::CreateCluster { unit, address } => {
            admin.create_cluster(&cluster_name, &unit, &address).await?
        }
        AdminOperation::AddInstance { unit, address } => {
            admin.add_instance(&cluster_name, &unit, &address).await?
        }
        AdminOperation::RemoveInstance { address, force, .. } => {
            admin.remove_instance(&cluster_name, &address, force).await?
        }
        AdminOperation::ElectPrimary => admin.elect_primary(&cluster_name).await?,
    }
    Ok(())
}
