//! Error types for the unit reconciler

use std::time::Duration;

use thiserror::Error;

use crate::admin::AdminError;
use crate::store::StoreError;
use crate::tls::TlsError;

/// How an error is handled by the event loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff, logged, never surfaced
    TransientInfra,
    /// Deferred until a later event makes it satisfiable
    PreconditionNotMet,
    /// Requires operator attention; surfaced as a blocked status
    DataConflict,
    /// Unrecoverable without intervention; surfaced as an error status
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("transient failure: {0}")]
    TransientInfra(String),

    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("data conflict: {0}")]
    DataConflict(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation requires leadership")]
    NotLeader,

    #[error("credential already issued for relation {relation_id}")]
    AlreadyIssued { relation_id: u32 },

    #[error("advisory lock held by {owner} for {operation}")]
    LockHeld { owner: String, operation: String },

    #[error("Admin client error: {0}")]
    Admin(#[from] AdminError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

impl Error {
    /// Classify the error for the event loop
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientInfra(_) => ErrorKind::TransientInfra,
            Error::PreconditionNotMet(_) | Error::NotLeader | Error::LockHeld { .. } => {
                ErrorKind::PreconditionNotMet
            }
            Error::DataConflict(_) | Error::AlreadyIssued { .. } => ErrorKind::DataConflict,
            Error::Fatal(_) | Error::InvalidConfig(_) | Error::Serialization(_) => ErrorKind::Fatal,
            Error::Admin(e) => {
                if e.is_transient() {
                    ErrorKind::TransientInfra
                } else {
                    ErrorKind::Fatal
                }
            }
            Error::Store(StoreError::NotFound(_)) => ErrorKind::PreconditionNotMet,
            Error::Store(e) => {
                if e.is_transient() {
                    ErrorKind::TransientInfra
                } else {
                    ErrorKind::Fatal
                }
            }
            Error::ObjectStore(e) => match e {
                object_store::Error::NotFound { .. } => ErrorKind::PreconditionNotMet,
                object_store::Error::Precondition { .. }
                | object_store::Error::AlreadyExists { .. } => ErrorKind::DataConflict,
                object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
                    ErrorKind::TransientInfra
                }
                _ => ErrorKind::Fatal,
            },
            Error::Kube(e) => match e {
                // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    if (400..500).contains(&code) && code != 409 && code != 429 {
                        ErrorKind::Fatal
                    } else {
                        ErrorKind::TransientInfra
                    }
                }
                _ => ErrorKind::TransientInfra,
            },
            Error::Tls(e) => {
                if e.is_validation() {
                    ErrorKind::DataConflict
                } else if e.is_transient() {
                    ErrorKind::TransientInfra
                } else {
                    ErrorKind::Fatal
                }
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfra
    }

    /// Whether the condition may clear without operator action
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientInfra | ErrorKind::PreconditionNotMet
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration for requeued events
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        Duration::from_secs_f64(delay_with_jitter.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before an event that failed with `error` is handled again
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        match error.kind() {
            ErrorKind::TransientInfra => self.delay_for_attempt(attempt),
            // Preconditions usually clear on the next peer or relation event
            ErrorKind::PreconditionNotMet => self.initial_delay.max(self.delay_for_attempt(attempt)),
            ErrorKind::DataConflict | ErrorKind::Fatal => self.max_delay,
        }
    }
}

/// Consecutive failure tracking for one concern of the unit
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ErrorContext {
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }

    pub fn exceeded_max_retries(&self, max_retries: u32) -> bool {
        self.consecutive_errors >= max_retries
    }
}
