use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, Query, State,
        rejection::{PathRejection, QueryRejection},
    },
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::{
    application::{
        error::{HttpError, INVALID_REQUEST_MESSAGE},
        pipeline::{RenderPipeline, ServedCard},
    },
    domain::card::PNG_CONTENT_TYPE,
};

use super::middleware::{log_responses, set_request_context};

const SOURCE: &str = "infra::http::public::card";
const IMMUTABLE_CACHE_CONTROL: HeaderValue =
    HeaderValue::from_static("public, max-age=31536000, immutable");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<RenderPipeline>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/{template}/{file}", get(card))
        .fallback(fallback)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CardQuery {
    options: Option<String>,
}

async fn card(
    State(state): State<HttpState>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<CardQuery>, QueryRejection>,
) -> Result<Response, HttpError> {
    let Path((template, file)) = path.map_err(|err| rejected_input(&err))?;
    let Query(query) = query.map_err(|err| rejected_input(&err))?;

    let served = state
        .pipeline
        .handle(&template, &file, query.options.as_deref())
        .await?;
    Ok(card_response(served))
}

fn card_response(served: ServedCard) -> Response {
    let content_type = HeaderValue::from_str(&served.artifact.content_type)
        .unwrap_or(HeaderValue::from_static(PNG_CONTENT_TYPE));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CACHE_CONTROL, IMMUTABLE_CACHE_CONTROL);
    headers.insert(X_CACHE, HeaderValue::from_static(served.status.as_str()));

    (StatusCode::OK, headers, served.artifact.body).into_response()
}

fn rejected_input(err: &dyn std::error::Error) -> HttpError {
    HttpError::from_error(
        SOURCE,
        StatusCode::INTERNAL_SERVER_ERROR,
        INVALID_REQUEST_MESSAGE,
        err,
    )
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn fallback() -> HttpError {
    HttpError::new(
        "infra::http::public::fallback",
        StatusCode::INTERNAL_SERVER_ERROR,
        INVALID_REQUEST_MESSAGE,
        "path does not match /{template}/{title}.png",
    )
}
