//! Operator surface, bound to its own listener.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::{
    error::AppError,
    purge::{CachePurger, purge_prefix},
};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct AdminState {
    pub purger: CachePurger,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/cache/purge", post(purge_cache))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PurgeBody {
    path: String,
}

#[derive(Debug, Serialize)]
struct PurgeAccepted {
    prefix: String,
}

async fn purge_cache(
    State(state): State<AdminState>,
    body: Result<Json<PurgeBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body.map_err(|err| AppError::validation(err.body_text()))?;
    let prefix = purge_prefix(&body.path).map_err(|err| AppError::validation(err.to_string()))?;

    info!(
        target = "infra::http::admin",
        op = "purge_cache",
        result = "accepted",
        prefix = %prefix,
        "Cache purge scheduled"
    );

    let purger = state.purger.clone();
    let task_prefix = prefix.clone();
    tokio::spawn(async move {
        purger.purge(&task_prefix).await;
    });

    Ok((StatusCode::ACCEPTED, Json(PurgeAccepted { prefix })).into_response())
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
