//! Finite state machine for the cluster membership lifecycle
//!
//! The state is never stored: every pass derives it from the peer record,
//! picks the event the observed facts imply and runs it through the
//! transition table. Guards encode the leader-only and readiness rules, so a
//! failed guard simply means "nothing to do this pass".

use std::fmt;

/// Lifecycle of the cluster as seen by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// No cluster recorded
    Uninitialized,
    /// Bootstrap issued in this pass, not yet recorded
    Initializing,
    /// Cluster recorded as initialized
    Active,
    /// A restore marker is present
    Restoring,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Uninitialized => write!(f, "Uninitialized"),
            ClusterState::Initializing => write!(f, "Initializing"),
            ClusterState::Active => write!(f, "Active"),
            ClusterState::Restoring => write!(f, "Restoring"),
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// No live cluster exists and nothing is recorded
    ClusterAbsent,
    /// A live cluster exists although none is recorded
    LiveClusterFound,
    /// Bootstrap completed on the engine
    CreateSucceeded,
    /// Bootstrap did not produce a live cluster
    CreateFailed,
    /// Membership should converge toward the ready units
    MembershipDrift,
    /// A restore marker was written
    RestoreRequested,
    /// The restore marker was cleared
    RestoreCompleted,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::ClusterAbsent => write!(f, "ClusterAbsent"),
            ClusterEvent::LiveClusterFound => write!(f, "LiveClusterFound"),
            ClusterEvent::CreateSucceeded => write!(f, "CreateSucceeded"),
            ClusterEvent::CreateFailed => write!(f, "CreateFailed"),
            ClusterEvent::MembershipDrift => write!(f, "MembershipDrift"),
            ClusterEvent::RestoreRequested => write!(f, "RestoreRequested"),
            ClusterEvent::RestoreCompleted => write!(f, "RestoreCompleted"),
        }
    }
}

/// Facts observed at the start of a pass
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Whether this unit holds the lease
    pub is_leader: bool,
    /// Units that announced a configured instance and are not departing
    pub ready_units: usize,
    /// Whether the admin client reported a live cluster
    pub live_cluster: bool,
    /// Whether a restore marker is recorded
    pub restore_marker: bool,
}

impl TransitionContext {
    pub fn new(is_leader: bool, ready_units: usize) -> Self {
        Self {
            is_leader,
            ready_units,
            live_cluster: false,
            restore_marker: false,
        }
    }

    pub fn with_live_cluster(mut self, live_cluster: bool) -> Self {
        self.live_cluster = live_cluster;
        self
    }

    pub fn with_restore_marker(mut self, restore_marker: bool) -> Self {
        self.restore_marker = restore_marker;
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ClusterState,
    pub to: ClusterState,
    pub event: ClusterEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterState,
        to: ClusterState,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: ClusterState,
        to: ClusterState,
        event: ClusterEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ClusterState,
        event: ClusterEvent,
    },
    GuardFailed {
        from: ClusterState,
        to: ClusterState,
        event: ClusterEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target state when the transition may proceed
    pub fn target(&self) -> Option<ClusterState> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Membership state machine
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === Uninitialized ===
                Transition::new(
                    ClusterState::Uninitialized,
                    ClusterState::Initializing,
                    ClusterEvent::ClusterAbsent,
                    "Bootstrapping the cluster on a ready unit",
                ),
                Transition::new(
                    ClusterState::Uninitialized,
                    ClusterState::Active,
                    ClusterEvent::LiveClusterFound,
                    "Adopting a live cluster missing from the peer record",
                ),
                Transition::new(
                    ClusterState::Uninitialized,
                    ClusterState::Restoring,
                    ClusterEvent::RestoreRequested,
                    "Restore requested before the cluster was initialized",
                ),
                // === Initializing ===
                Transition::new(
                    ClusterState::Initializing,
                    ClusterState::Active,
                    ClusterEvent::CreateSucceeded,
                    "Cluster created, recording it as initialized",
                ),
                Transition::new(
                    ClusterState::Initializing,
                    ClusterState::Uninitialized,
                    ClusterEvent::CreateFailed,
                    "Cluster creation failed, retrying on a later pass",
                ),
                // === Active ===
                Transition::new(
                    ClusterState::Active,
                    ClusterState::Active,
                    ClusterEvent::MembershipDrift,
                    "Converging membership toward the ready units",
                ),
                Transition::new(
                    ClusterState::Active,
                    ClusterState::Restoring,
                    ClusterEvent::RestoreRequested,
                    "Scaling down to the restoring unit",
                ),
                // === Restoring ===
                Transition::new(
                    ClusterState::Restoring,
                    ClusterState::Restoring,
                    ClusterEvent::MembershipDrift,
                    "Removing members other than the restoring unit",
                ),
                Transition::new(
                    ClusterState::Restoring,
                    ClusterState::Uninitialized,
                    ClusterEvent::RestoreCompleted,
                    "Restore finished, cluster will be re-initialized",
                ),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &ClusterState,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ClusterState, event: &ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &ClusterState) -> Vec<&ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        // Every transition writes topology keys or mutates the cluster
        if !ctx.is_leader {
            return Some(format!(
                "{} requires leadership",
                transition.description.to_lowercase()
            ));
        }

        match (&transition.from, &transition.to, &transition.event) {
            (ClusterState::Uninitialized, ClusterState::Initializing, ClusterEvent::ClusterAbsent) => {
                if ctx.ready_units == 0 {
                    Some("No unit is ready to bootstrap the cluster".to_string())
                } else if ctx.live_cluster {
                    Some("A live cluster already exists".to_string())
                } else {
                    None
                }
            }
            (_, _, ClusterEvent::LiveClusterFound) | (_, _, ClusterEvent::CreateSucceeded) => {
                if !ctx.live_cluster {
                    Some("No live cluster reported".to_string())
                } else {
                    None
                }
            }
            (_, ClusterState::Restoring, ClusterEvent::RestoreRequested) => {
                if !ctx.restore_marker {
                    Some("No restore marker recorded".to_string())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Determine the event implied by the observed facts
pub fn determine_event(current: &ClusterState, ctx: &TransitionContext) -> ClusterEvent {
    // A restore marker overrides everything else
    if ctx.restore_marker && *current != ClusterState::Restoring {
        return ClusterEvent::RestoreRequested;
    }

    match current {
        ClusterState::Uninitialized if ctx.live_cluster => ClusterEvent::LiveClusterFound,
        ClusterState::Uninitialized => ClusterEvent::ClusterAbsent,
        ClusterState::Initializing if ctx.live_cluster => ClusterEvent::CreateSucceeded,
        ClusterState::Initializing => ClusterEvent::CreateFailed,
        ClusterState::Restoring if !ctx.restore_marker => ClusterEvent::RestoreCompleted,
        ClusterState::Active | ClusterState::Restoring => ClusterEvent::MembershipDrift,
    }
}
