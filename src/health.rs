//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (has the unit finished its first pass?)
//! - `/metrics` - Prometheus metrics
//!
//! Operator actions are mounted on the same listener (see [`crate::actions`]).

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels for per-event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EventLabels {
    pub event: String,
}

impl prometheus_client::encoding::EncodeLabelSet for EventLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("event", self.event.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for failed events
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub event: String,
    pub kind: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ErrorLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("event", self.event.as_str()).encode(encoder.encode_label())?;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for admin operations and backups
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub operation: String,
    pub outcome: String,
}

impl prometheus_client::encoding::EncodeLabelSet for OutcomeLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for member counts
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StatusLabels {
    pub status: String,
}

impl prometheus_client::encoding::EncodeLabelSet for StatusLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("status", self.status.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Handled events
    pub events_total: Family<EventLabels, Counter>,
    /// Events that ended in an error
    pub event_errors_total: Family<ErrorLabels, Counter>,
    /// Time spent handling one event
    pub event_duration_seconds: Family<EventLabels, Histogram>,
    /// Cluster-mutating admin operations by outcome
    pub admin_operations_total: Family<OutcomeLabels, Counter>,
    /// Backups and restores by outcome
    pub backups_total: Family<OutcomeLabels, Counter>,

    /// Live members by status
    pub cluster_members: Family<StatusLabels, Gauge>,
    /// Value of the units-added counter
    pub units_added_to_cluster: Gauge,
    /// 1 while this unit holds the lease
    pub is_leader: Gauge,
    /// Current unit status, one series per severity set to 1 or 0
    pub unit_status: Family<StatusLabels, Gauge>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "mysql_operator_events",
            "Total number of handled unit events",
            events_total.clone(),
        );

        let event_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "mysql_operator_event_errors",
            "Total number of unit events that ended in an error",
            event_errors_total.clone(),
        );

        let event_duration_seconds = Family::<EventLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        registry.register(
            "mysql_operator_event_duration_seconds",
            "Duration of event handling in seconds",
            event_duration_seconds.clone(),
        );

        let admin_operations_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "mysql_operator_admin_operations",
            "Total number of cluster admin operations by outcome",
            admin_operations_total.clone(),
        );

        let backups_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "mysql_operator_backups",
            "Total number of backup and restore operations by outcome",
            backups_total.clone(),
        );

        let cluster_members = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "mysql_operator_cluster_members",
            "Live cluster members by status",
            cluster_members.clone(),
        );

        let units_added_to_cluster = Gauge::default();
        registry.register(
            "mysql_operator_units_added_to_cluster",
            "Units ever added to the cluster",
            units_added_to_cluster.clone(),
        );

        let is_leader = Gauge::default();
        registry.register(
            "mysql_operator_is_leader",
            "Whether this unit holds the leader lease",
            is_leader.clone(),
        );

        let unit_status = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "mysql_operator_unit_status",
            "Current unit status severity",
            unit_status.clone(),
        );

        Self {
            events_total,
            event_errors_total,
            event_duration_seconds,
            admin_operations_total,
            backups_total,
            cluster_members,
            units_added_to_cluster,
            is_leader,
            unit_status,
            registry,
        }
    }

    /// Record a handled event
    pub fn record_event(&self, event: &str, duration_secs: f64) {
        let labels = EventLabels {
            event: event.to_string(),
        };
        self.events_total.get_or_create(&labels).inc();
        self.event_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed event
    pub fn record_error(&self, event: &str, kind: &str) {
        let labels = ErrorLabels {
            event: event.to_string(),
            kind: kind.to_string(),
        };
        self.event_errors_total.get_or_create(&labels).inc();
    }

    pub fn record_admin_operation(&self, operation: &str, success: bool) {
        self.admin_operations_total
            .get_or_create(&outcome(operation, success))
            .inc();
    }

    pub fn record_backup(&self, operation: &str, success: bool) {
        self.backups_total
            .get_or_create(&outcome(operation, success))
            .inc();
    }

    /// Replace the member gauges with the counts of one topology snapshot
    pub fn set_cluster_members(&self, counts: &[(&str, i64)]) {
        self.cluster_members.clear();
        for (status, count) in counts {
            self.cluster_members
                .get_or_create(&StatusLabels {
                    status: status.to_string(),
                })
                .set(*count);
        }
    }

    pub fn set_unit_status(&self, severity: &str) {
        for candidate in ["active", "waiting", "blocked", "error"] {
            self.unit_status
                .get_or_create(&StatusLabels {
                    status: candidate.to_string(),
                })
                .set(i64::from(candidate == severity));
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

fn outcome(operation: &str, success: bool) -> OutcomeLabels {
    OutcomeLabels {
        operation: operation.to_string(),
        outcome: if success { "success" } else { "failure" }.to_string(),
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the unit completed its first reconciliation pass
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successfully handled event, seconds since the epoch
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the first pass completed.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve `router` on `addr` until the task is dropped
pub async fn run_health_server(addr: SocketAddr, router: Router) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");

    axum::serve(listener, router).await
}
