//! Unit status derived from per-concern conditions
//!
//! Every concern (membership, credentials, TLS, backups, ...) keeps one
//! condition. The unit status is the condition with the highest severity and
//! is published to the unit's peer entry and to the metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::controller::error::{Error, ErrorKind, Result};
use crate::health::Metrics;
use crate::peer::PeerState;
use crate::peer::record::UNIT_STATUS;

/// Concerns reporting conditions
pub mod concerns {
    pub const MEMBERSHIP: &str = "Membership";
    pub const INSTANCE: &str = "Instance";
    pub const CREDENTIALS: &str = "Credentials";
    pub const DATABASE: &str = "Database";
    pub const TLS: &str = "Tls";
    pub const BACKUP: &str = "Backup";
    pub const S3: &str = "ObjectStorage";
}

/// Unit status severity, ordered from least to most severe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Active,
    Waiting,
    Blocked,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Active => "active",
            Severity::Waiting => "waiting",
            Severity::Blocked => "blocked",
            Severity::Error => "error",
        }
    }
}

/// State of one concern
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub concern: String,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Builder for creating and updating conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    pub fn from_existing(existing: Vec<Condition>) -> Self {
        Self {
            conditions: existing,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(
        mut self,
        concern: &str,
        severity: Severity,
        reason: &str,
        message: &str,
    ) -> Self {
        let now = Utc::now();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.concern == concern) {
            // Transition time only moves when the severity changes
            if existing.severity != severity {
                existing.severity = severity;
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        } else {
            self.conditions.push(Condition {
                concern: concern.to_string(),
                severity,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            });
        }
        self
    }

    pub fn active(self, concern: &str, message: &str) -> Self {
        self.set_condition(concern, Severity::Active, "Ready", message)
    }

    pub fn waiting(self, concern: &str, reason: &str, message: &str) -> Self {
        self.set_condition(concern, Severity::Waiting, reason, message)
    }

    pub fn blocked(self, concern: &str, reason: &str, message: &str) -> Self {
        self.set_condition(concern, Severity::Blocked, reason, message)
    }

    pub fn error(self, concern: &str, reason: &str, message: &str) -> Self {
        self.set_condition(concern, Severity::Error, reason, message)
    }

    /// Drop a concern entirely
    pub fn clear(mut self, concern: &str) -> Self {
        self.conditions.retain(|c| c.concern != concern);
        self
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status published for the unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub severity: Severity,
    pub message: String,
}

impl UnitStatus {
    /// Most severe condition wins; the first one set wins a tie
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        let mut worst: Option<&Condition> = None;
        for condition in conditions {
            if worst.is_none_or(|w| condition.severity > w.severity) {
                worst = Some(condition);
            }
        }
        match worst {
            Some(c) => Self {
                severity: c.severity,
                message: c.message.clone(),
            },
            None => Self {
                severity: Severity::Waiting,
                message: "starting".to_string(),
            },
        }
    }
}

/// Condition an error leaves on its concern, `None` when it is only logged.
///
/// Admin and object-storage calls always run under the retry policy, so a
/// transient one reaching here has exhausted its attempts.
pub fn condition_for_error(error: &Error) -> Option<(Severity, &'static str)> {
    match error.kind() {
        ErrorKind::TransientInfra => match error {
            Error::Admin(_) | Error::ObjectStore(_) => Some((Severity::Error, "RetriesExhausted")),
            _ => None,
        },
        ErrorKind::PreconditionNotMet => None,
        ErrorKind::DataConflict => Some((Severity::Blocked, "DataConflict")),
        ErrorKind::Fatal => Some((Severity::Error, "Fatal")),
    }
}

#[derive(Default)]
struct StatusInner {
    conditions: Vec<Condition>,
    /// Set by a fatal error; cleared only by a restart
    halted: Option<String>,
}

/// Tracks the conditions of one unit
#[derive(Default)]
pub struct StatusManager {
    inner: RwLock<StatusInner>,
}

impl StatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply changes through a [`ConditionBuilder`]
    pub async fn update<F>(&self, change: F)
    where
        F: FnOnce(ConditionBuilder) -> ConditionBuilder,
    {
        let mut inner = self.inner.write().await;
        let existing = std::mem::take(&mut inner.conditions);
        inner.conditions = change(ConditionBuilder::from_existing(existing)).build();
    }

    pub async fn set(&self, concern: &str, severity: Severity, reason: &str, message: &str) {
        self.update(|b| b.set_condition(concern, severity, reason, message))
            .await;
    }

    pub async fn clear(&self, concern: &str) {
        self.update(|b| b.clear(concern)).await;
    }

    /// Surface `error` on `concern` according to its kind.
    ///
    /// A fatal error halts every further mutation until the process restarts.
    pub async fn record_error(&self, concern: &str, error: &Error) {
        let Some((severity, reason)) = condition_for_error(error) else {
            return;
        };
        if error.kind() == ErrorKind::Fatal {
            error!(concern, error = %error, "Fatal error, halting cluster mutations");
            self.inner.write().await.halted = Some(error.to_string());
        } else {
            warn!(concern, error = %error, severity = severity.as_str(), "Surfacing error");
        }
        self.set(concern, severity, reason, &error.to_string()).await;
    }

    pub async fn conditions(&self) -> Vec<Condition> {
        self.inner.read().await.conditions.clone()
    }

    pub async fn condition(&self, concern: &str) -> Option<Condition> {
        self.inner
            .read()
            .await
            .conditions
            .iter()
            .find(|c| c.concern == concern)
            .cloned()
    }

    pub async fn current(&self) -> UnitStatus {
        UnitStatus::from_conditions(&self.inner.read().await.conditions)
    }

    /// Reason mutations are halted, if they are
    pub async fn halted(&self) -> Option<String> {
        self.inner.read().await.halted.clone()
    }

    /// Write the current status to this unit's peer entry
    pub async fn publish(&self, peers: &PeerState, metrics: Option<&Metrics>) -> Result<UnitStatus> {
        let status = self.current().await;
        peers
            .update_unit(&[(UNIT_STATUS, Some(serde_json::to_string(&status)?))])
            .await?;
        if let Some(metrics) = metrics {
            metrics.set_unit_status(status.severity.as_str());
        }
        Ok(status)
    }
}
