//! Retrieval and ranking pipeline.
//!
//! The engine in [`pipeline`] consumes its external collaborators through the
//! traits defined here and in [`rerank`], [`cache`] and [`metrics`]. The
//! [`vector`], [`bm25`] and [`catalog`] modules provide local implementations.

pub mod bm25;
pub mod cache;
pub mod catalog;
pub mod expansion;
pub mod facets;
pub mod hybrid;
pub mod metrics;
pub mod multi_step;
pub mod pipeline;
pub mod rerank;
pub mod scoring;
pub mod suggest;
pub mod text;
pub mod vector;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Candidate, ChunkRecord, DocumentMeta, OwnerScope};

/// Options pushed down into a single retrieval call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOptions {
    /// 1-50
    pub limit: usize,
    /// Minimum normalized score (0-1) a candidate needs to be returned.
    pub threshold: f32,
    pub document_ids: Option<Vec<Uuid>>,
    pub element_types: Option<Vec<String>>,
    pub page_numbers: Option<Vec<u32>>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 0.3,
            document_ids: None,
            element_types: None,
            page_numbers: None,
        }
    }
}

impl RetrievalOptions {
    /// Whether a stored chunk passes the owner, document, element and page filters.
    pub fn admits(&self, owner: &OwnerScope, chunk: &ChunkRecord) -> bool {
        if chunk.owner_id != owner.as_str() {
            return false;
        }
        if let Some(ids) = &self.document_ids {
            if !ids.contains(&chunk.document_id) {
                return false;
            }
        }
        if let Some(types) = &self.element_types {
            match &chunk.element_type {
                Some(t) if types.iter().any(|x| x.eq_ignore_ascii_case(t)) => {}
                _ => return false,
            }
        }
        if let Some(pages) = &self.page_numbers {
            match chunk.page_number {
                Some(p) if pages.contains(&p) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Output of one retrieval call.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    /// Best first, every score >= the requested threshold.
    pub results: Vec<Candidate>,
    /// Matches before `limit` truncation.
    pub total_results: usize,
    pub search_time_ms: u64,
    pub cache_hit: bool,
}

/// Embedding + similarity search over document chunks.
///
/// Implementations must return an error, not an empty result, when the
/// embedding call fails.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        owner: &OwnerScope,
        options: &RetrievalOptions,
    ) -> Result<RetrievalOutput>;
}

/// Keyword relevance search over document chunks. Scores are normalized to 0-1.
#[async_trait]
pub trait LexicalSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        owner: &OwnerScope,
        options: &RetrievalOptions,
    ) -> Result<RetrievalOutput>;
}

/// Document metadata store used to resolve date and document-type facets.
#[async_trait]
pub trait DocumentMetadata: Send + Sync {
    /// Unknown ids are omitted from the output.
    async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<DocumentMeta>>;
}
