pub mod context;
pub mod error;
pub mod membership;
pub mod reconciler;
pub mod retry;
pub mod state_machine;
pub mod status;

pub use context::{Collaborators, Context};
pub use error::{BackoffConfig, Error, ErrorContext, ErrorKind, Result};
pub use membership::{Executor, MembershipPolicy, ReconcilePlan, plan};
pub use reconciler::{fetch_live, handle_event};
pub use retry::RetryPolicy;
pub use state_machine::{ClusterEvent, ClusterState, ClusterStateMachine};
pub use status::{ConditionBuilder, Severity, StatusManager, UnitStatus, concerns};
