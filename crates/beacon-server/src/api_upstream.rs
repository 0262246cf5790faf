//! Hub endpoints agents push to and pull from.

use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use beacon_types::{AgentStatus, PullResponse, PushData};
use beacon_upstream::{agent_status, apply_push, pull_reference_data, ApplyOutcome, UpstreamError};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Maps replication errors to HTTP responses.
#[derive(Debug)]
pub struct ApiError(UpstreamError);

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        Self(e)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            UpstreamError::UnknownAgent(_) => StatusCode::NOT_FOUND,
            UpstreamError::UnknownTable(_)
            | UpstreamError::UnknownColumn { .. }
            | UpstreamError::InvalidKey { .. }
            | UpstreamError::MissingAgentName
            | UpstreamError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "upstream request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, UpstreamError> + Send + 'static,
{
    let pool = state.pool.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut *conn)
    })
    .await
    .map_err(UpstreamError::from)?;
    Ok(result?)
}

pub async fn push_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(data): Json<PushData>,
) -> Result<Json<Value>, ApiError> {
    let agent = data.agent_name.clone();
    let count = data.count();
    let outcome = blocking(&state, move |conn| apply_push(conn, &data)).await?;

    let body = match outcome {
        ApplyOutcome::Applied {
            rows,
            deleted,
            skipped,
        } => json!({ "status": "applied", "rows": rows, "deleted": deleted, "skipped": skipped }),
        ApplyOutcome::Duplicate => json!({ "status": "duplicate" }),
    };
    tracing::debug!(agent = %agent, count, "handled upstream push");
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub since: Option<String>,
}

pub async fn pull_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(agent_name): Path<String>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, ApiError> {
    let tables = state.hub.reference_tables.clone();
    let response = blocking(&state, move |conn| {
        pull_reference_data(conn, &agent_name, params.since.as_deref(), &tables)
    })
    .await?;
    Ok(Json(response))
}

pub async fn status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(agent_name): Path<String>,
) -> Result<Json<AgentStatus>, ApiError> {
    let status = blocking(&state, move |conn| agent_status(conn, &agent_name)).await?;
    Ok(Json(status))
}
