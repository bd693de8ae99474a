use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::api::{error_response, owner_from_headers};
use crate::models::{SearchRequest, SearchResponse};
use crate::state::AppState;

/// POST /api/search - Run the retrieval pipeline for the caller's documents:
///   1. Optional query expansion
///   2. Retrieval by search type (vector, hybrid, context-aware, multi-step)
///   3. Weighted fusion, optional cross-encoder rerank
///   4. Quality scoring, confidence cut and facets
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    // Malformed bodies (including bad bbox shapes) are a 400, not axum's 422
    let Json(req) = payload.map_err(|e| (StatusCode::BAD_REQUEST, e.body_text()))?;
    let owner = owner_from_headers(&headers)?;

    let (query, search_type, options) = req
        .into_parts(&state.config.search)
        .map_err(error_response)?;

    let resp = state
        .engine
        .search(&query, &owner, search_type, &options)
        .await
        .map_err(error_response)?;

    tracing::info!(
        "Search '{}' ({}) returned {} of {} candidates in {}ms",
        resp.query,
        resp.search_type,
        resp.results.len(),
        resp.total_candidates,
        resp.timing.total_ms
    );
    Ok(Json(resp))
}
