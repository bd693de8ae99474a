//! Structural facet filtering.
//!
//! Every predicate is independent and conjunctive, so the order of checks does
//! not matter and applying the same filter twice changes nothing.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::Result;
use crate::models::{Candidate, DocumentMeta, FacetFilter, RankedResult};
use crate::search::DocumentMetadata;

/// Owning-document metadata needed by date and document-type predicates.
pub type DocumentIndex = HashMap<Uuid, DocumentMeta>;

/// Fetch metadata for the documents referenced by `results`, only when the
/// filter has a predicate that needs it.
pub async fn resolve_documents(
    store: &dyn DocumentMetadata,
    facets: &FacetFilter,
    results: &[RankedResult],
) -> Result<DocumentIndex> {
    if !facets.needs_document_metadata() || results.is_empty() {
        return Ok(DocumentIndex::new());
    }
    let mut ids: Vec<Uuid> = results.iter().map(|r| r.candidate.document_id).collect();
    ids.sort();
    ids.dedup();
    let docs = store.lookup(&ids).await?;
    Ok(docs.into_iter().map(|d| (d.id, d)).collect())
}

pub fn apply_facets(
    results: Vec<RankedResult>,
    facets: &FacetFilter,
    documents: &DocumentIndex,
) -> Vec<RankedResult> {
    if facets.is_empty() {
        return results;
    }
    results
        .into_iter()
        .filter(|r| matches(&r.candidate, facets, documents))
        .collect()
}

pub fn matches(c: &Candidate, facets: &FacetFilter, documents: &DocumentIndex) -> bool {
    if let Some(bounds) = &facets.chunk_length {
        if !bounds.contains(c.content.chars().count()) {
            return false;
        }
    }

    if let Some(types) = &facets.element_types {
        match &c.element_type {
            Some(t) if types.iter().any(|x| x.eq_ignore_ascii_case(t)) => {}
            _ => return false,
        }
    }

    if let Some(pages) = &facets.page_numbers {
        match c.page_number {
            Some(p) if pages.contains(&p) => {}
            _ => return false,
        }
    }

    if let Some(spatial) = &facets.spatial_search {
        if c.page_number != Some(spatial.page_number) {
            return false;
        }
        match &c.bbox {
            Some(b) if b.intersects(&spatial.bbox) => {}
            _ => return false,
        }
    }

    if facets.needs_document_metadata() {
        // Unknown documents cannot satisfy date or type predicates.
        let Some(doc) = documents.get(&c.document_id) else {
            return false;
        };
        if let Some(range) = &facets.date_range {
            if !range.contains(&doc.created_at) {
                return false;
            }
        }
        if let Some(types) = &facets.document_types {
            match &doc.document_type {
                Some(t) if types.iter().any(|x| x.eq_ignore_ascii_case(t)) => {}
                _ => return false,
            }
        }
    }

    true
}
