use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::api::owner_from_headers;
use crate::models::{
    ChunkRecord, DocumentMeta, HealthResponse, IndexDocumentRequest, IndexDocumentResponse,
};
use crate::state::AppState;

/// POST /api/documents - Index a document's pre-extracted chunks into the
/// vector store, the lexical index and the catalog.
pub async fn index_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<IndexDocumentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IndexDocumentResponse>), (StatusCode, String)> {
    let Json(req) = payload.map_err(|e| (StatusCode::BAD_REQUEST, e.body_text()))?;
    let owner = owner_from_headers(&headers)?;

    let name = req.original_name.trim().to_string();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "originalName is required".to_string()));
    }
    if req.chunks.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "At least one chunk is required".to_string()));
    }
    if let Some(i) = req.chunks.iter().position(|c| c.content.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, format!("Chunk {i} has no content")));
    }
    if req.chunks.iter().any(|c| c.page_number == Some(0)) {
        return Err((StatusCode::BAD_REQUEST, "Page numbers start at 1".to_string()));
    }

    let document = DocumentMeta {
        id: Uuid::new_v4(),
        owner_id: owner.as_str().to_string(),
        original_name: name,
        document_type: req.document_type.map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()),
        created_at: req.created_at.unwrap_or_else(Utc::now),
    };

    let chunks: Vec<ChunkRecord> = req
        .chunks
        .into_iter()
        .map(|c| ChunkRecord {
            chunk_id: Uuid::new_v4(),
            document_id: document.id,
            owner_id: document.owner_id.clone(),
            content: c.content,
            page_number: c.page_number,
            element_type: c.element_type,
            bbox: c.bbox,
        })
        .collect();

    let _permit = state
        .index_semaphore
        .acquire()
        .await
        .map_err(|_| (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down".to_string()))?;

    state.vectors.index_chunks(&chunks).await.map_err(|e| {
        tracing::error!("Failed to embed document {}: {e:#}", document.id);
        (StatusCode::SERVICE_UNAVAILABLE, format!("Embedding failed: {e:#}"))
    })?;

    let bm25 = state.bm25.clone();
    let lexical_chunks = chunks.clone();
    let lexical = tokio::task::spawn_blocking(move || bm25.index_chunks(&lexical_chunks))
        .await
        .map_err(|e| anyhow::anyhow!("Indexing task failed: {e}"))
        .and_then(|r| r);
    if let Err(e) = lexical {
        tracing::error!("Failed to index document {} for keyword search: {e:#}", document.id);
        // Keep the two stores consistent
        if let Err(e) = state.vectors.store().delete_document(&document.id) {
            tracing::warn!("Failed to roll back vectors for {}: {e}", document.id);
        }
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Indexing failed: {e:#}"),
        ));
    }

    state.catalog.insert(document.clone()).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save document: {e:#}"),
        )
    })?;
    state.invalidate_cache();

    tracing::info!(
        "Indexed document {} ({}) with {} chunks",
        document.id,
        document.original_name,
        chunks.len()
    );

    Ok((
        StatusCode::CREATED,
        Json(IndexDocumentResponse {
            document,
            chunk_count: chunks.len(),
        }),
    ))
}

/// DELETE /api/documents/{id} - Remove a document and its index data
pub async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let owner = owner_from_headers(&headers)?;

    // Other owners' documents are reported as missing
    match state.catalog.get(&id) {
        Some(doc) if doc.owner_id == owner.as_str() => {}
        _ => return Err((StatusCode::NOT_FOUND, "Document not found".to_string())),
    }

    // Remove from BM25 index
    let bm25 = state.bm25.clone();
    match tokio::task::spawn_blocking(move || bm25.delete_document(&id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Failed to delete BM25 data for {id}: {e}"),
        Err(e) => tracing::warn!("BM25 delete task for {id} failed: {e}"),
    }

    // Remove from vector store
    if let Err(e) = state.vectors.store().delete_document(&id) {
        tracing::warn!("Failed to delete vector data for {id}: {e}");
    }

    state.catalog.remove(&id).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to update catalog: {e:#}"),
        )
    })?;
    state.invalidate_cache();

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/health - Store sizes and collaborator configuration
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        documents: state.catalog.len(),
        vector_entries: state.vectors.store().entry_count(),
        lexical_entries: state.bm25.num_docs(),
        reranker_configured: state.reranker_configured,
    })
}
