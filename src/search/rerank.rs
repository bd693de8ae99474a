//! Secondary relevance pass over the top fused candidates.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Candidate;

/// Relevance score for one document of a rerank request.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankScore {
    /// Index into the documents slice that was sent.
    pub index: usize,
    /// Relevance in 0-1.
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `documents` against `query`. Returns at most `top_k` entries, best first.
    async fn rerank(&self, query: &str, documents: &[String], top_k: usize)
        -> Result<Vec<RerankScore>>;
}

/// A candidate after the (optional) rerank stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Shortlisted {
    pub candidate: Candidate,
    pub rerank_score: Option<f32>,
}

impl From<Candidate> for Shortlisted {
    fn from(candidate: Candidate) -> Self {
        Self {
            candidate,
            rerank_score: None,
        }
    }
}

/// Outcome of [`rerank_candidates`].
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub results: Vec<Shortlisted>,
    /// False when the reranker failed and fused order was kept.
    pub applied: bool,
}

/// Send the top `top_k` fused candidates to the reranker and adopt its order.
///
/// Candidates past `top_k` are dropped. Shortlisted candidates the reranker
/// did not return follow the reranked ones in fused order. If the reranker
/// fails, the full fused list is returned unchanged.
pub async fn rerank_candidates(
    reranker: &dyn Reranker,
    query: &str,
    candidates: Vec<Candidate>,
    top_k: usize,
) -> RerankOutcome {
    if candidates.is_empty() || top_k == 0 {
        return RerankOutcome {
            results: candidates.into_iter().map(Shortlisted::from).collect(),
            applied: false,
        };
    }

    let n = candidates.len().min(top_k);
    let documents: Vec<String> = candidates[..n].iter().map(|c| c.content.clone()).collect();

    let scores = match reranker.rerank(query, &documents, n).await {
        Ok(scores) => scores,
        Err(e) => {
            tracing::warn!("Re-ranking failed, keeping fused order: {e}");
            return RerankOutcome {
                results: candidates.into_iter().map(Shortlisted::from).collect(),
                applied: false,
            };
        }
    };

    let mut shortlist: Vec<Option<Candidate>> =
        candidates.into_iter().take(n).map(Some).collect();
    let mut seen = HashSet::new();
    let mut results = Vec::with_capacity(n);

    for s in scores {
        if s.index >= n || !s.score.is_finite() || !seen.insert(s.index) {
            tracing::warn!("Ignoring invalid rerank entry: index {} score {}", s.index, s.score);
            continue;
        }
        if let Some(candidate) = shortlist[s.index].take() {
            results.push(Shortlisted {
                candidate,
                rerank_score: Some(s.score.clamp(0.0, 1.0)),
            });
        }
    }

    if results.is_empty() {
        tracing::warn!("Reranker returned no usable scores, keeping fused order");
        return RerankOutcome {
            results: shortlist.into_iter().flatten().map(Shortlisted::from).collect(),
            applied: false,
        };
    }

    results.extend(shortlist.into_iter().flatten().map(Shortlisted::from));
    RerankOutcome {
        results,
        applied: true,
    }
}
