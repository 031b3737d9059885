//! Operator actions over HTTP
//!
//! Each route turns a request into a [`UnitEvent`] carrying a reply channel,
//! hands it to the unit's event loop and waits for the outcome. Actions are
//! therefore serialized with every other event the unit handles.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::backup::BackupKind;
use crate::controller::error::{Error, ErrorKind};
use crate::credentials::SystemUser;
use crate::events::{Reply, UnitEvent};

/// Shared state for action handlers
pub struct ActionState {
    events: mpsc::Sender<UnitEvent>,
}

impl ActionState {
    pub fn new(events: mpsc::Sender<UnitEvent>) -> Self {
        Self { events }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CreateBackupRequest {
    #[serde(default)]
    pub kind: BackupKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestoreRequest {
    pub backup_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub username: String,
    /// Generated when absent
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ActionError {
    pub error: String,
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
struct PasswordRotated {
    username: String,
}

/// Create the actions router
pub fn create_actions_router(state: Arc<ActionState>) -> Router {
    Router::new()
        .route("/actions/create-backup", post(create_backup))
        .route("/actions/list-backups", get(list_backups))
        .route("/actions/restore", post(restore))
        .route("/actions/set-password", post(set_password))
        .route("/actions/cluster-status", get(cluster_status))
        .with_state(state)
}

/// HTTP status for a failed action
pub fn status_for_error(error: &Error) -> StatusCode {
    match error {
        Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        Error::NotLeader => StatusCode::MISDIRECTED_REQUEST,
        _ => match error.kind() {
            ErrorKind::TransientInfra => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::PreconditionNotMet | ErrorKind::DataConflict => StatusCode::CONFLICT,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn kind_label(error: &Error) -> &'static str {
    match error.kind() {
        ErrorKind::TransientInfra => "transient",
        ErrorKind::PreconditionNotMet => "precondition-not-met",
        ErrorKind::DataConflict => "data-conflict",
        ErrorKind::Fatal => "fatal",
    }
}

fn error_response(status: StatusCode, error: String, kind: &'static str) -> Response {
    (status, Json(ActionError { error, kind })).into_response()
}

/// Send an event built around a fresh reply channel and wait for its outcome
async fn request<T, F>(state: &ActionState, build: F) -> Result<T, Response>
where
    F: FnOnce(Reply<T>) -> UnitEvent,
{
    let (tx, rx) = oneshot::channel();
    if state.events.send(build(tx)).await.is_err() {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "unit event loop is not running".to_string(),
            "transient",
        ));
    }
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(status_for_error(&e), e.to_string(), kind_label(&e))),
        Err(_) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "action dropped before completion".to_string(),
            "transient",
        )),
    }
}

fn respond<T: Serialize>(result: Result<T, Response>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn create_backup(
    State(state): State<Arc<ActionState>>,
    Json(body): Json<CreateBackupRequest>,
) -> Response {
    info!(kind = %body.kind, "Backup requested");
    respond(
        request(&state, |reply| UnitEvent::BackupRequested {
            kind: body.kind,
            reply: Some(reply),
        })
        .await,
    )
}

pub(crate) async fn list_backups(State(state): State<Arc<ActionState>>) -> Response {
    respond(request(&state, |reply| UnitEvent::ListBackupsRequested { reply }).await)
}

pub(crate) async fn restore(
    State(state): State<Arc<ActionState>>,
    Json(body): Json<RestoreRequest>,
) -> Response {
    if body.backup_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "backup-id must not be empty".to_string(),
            "fatal",
        );
    }
    info!(backup_id = %body.backup_id, force = body.force, "Restore requested");
    respond(
        request(&state, |reply| UnitEvent::RestoreRequested {
            backup_id: body.backup_id,
            force: body.force,
            reply: Some(reply),
        })
        .await,
    )
}

pub(crate) async fn set_password(
    State(state): State<Arc<ActionState>>,
    Json(body): Json<SetPasswordRequest>,
) -> Response {
    let Some(user) = SystemUser::from_username(&body.username) else {
        warn!(username = %body.username, "Password rotation for unknown user");
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("not a system user: {}", body.username),
            "fatal",
        );
    };
    let result = request(&state, |reply| UnitEvent::PasswordRotationRequested {
        user,
        password: body.password,
        reply: Some(reply),
    })
    .await
    .map(|()| PasswordRotated {
        username: user.username().to_string(),
    });
    respond(result)
}

pub(crate) async fn cluster_status(State(state): State<Arc<ActionState>>) -> Response {
    respond(request(&state, |reply| UnitEvent::ClusterStatusRequested { reply }).await)
}
