//! Axum HTTP handlers and the router that mounts them.

pub mod documents;
pub mod search;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::Router;

use crate::error::SearchError;
use crate::models::OwnerScope;
use crate::state::AppState;

/// Header carrying the caller's owner scope. Authentication happens upstream.
pub const OWNER_HEADER: &str = "x-owner-id";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(documents::health))
        .route("/api/search", post(search::search))
        .route("/api/documents", post(documents::index_document))
        .route("/api/documents/{id}", delete(documents::delete_document))
        .with_state(state)
}

/// Map a pipeline error to an HTTP status and message.
pub fn error_response(err: SearchError) -> (StatusCode, String) {
    let status = match &err {
        SearchError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        SearchError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SearchError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

pub fn owner_from_headers(headers: &HeaderMap) -> Result<OwnerScope, (StatusCode, String)> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(OwnerScope::new)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("{OWNER_HEADER} header is required"),
            )
        })
}
