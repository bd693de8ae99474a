//! Heuristic quality scoring on top of the fused / rerank score.
//!
//! `q = base + term_ratio * term_w + context_ratio * context_w`, then
//! `q *= short_penalty` for short passages, then clamp to [0, 1].

use crate::config::ScoringConfig;
use crate::error::{Result, SearchError};
use crate::models::RankedResult;
use crate::search::rerank::Shortlisted;
use crate::search::text;

/// Inputs shared by every candidate of one query.
#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub query: &'a str,
    /// Key terms of the conversation history; `None` when no history was given.
    pub context_terms: Option<&'a [String]>,
    pub config: &'a ScoringConfig,
}

pub fn score_candidates(
    items: Vec<Shortlisted>,
    input: &ScoringInput<'_>,
) -> Result<Vec<RankedResult>> {
    let query_words = text::tokenize(input.query);
    items
        .into_iter()
        .map(|item| score_one(item, &query_words, input))
        .collect()
}

fn score_one(
    item: Shortlisted,
    query_words: &[String],
    input: &ScoringInput<'_>,
) -> Result<RankedResult> {
    let cfg = input.config;
    let c = &item.candidate;
    let base = item.rerank_score.unwrap_or(c.fused_score);
    let mut notes = vec![describe_base(&item)];

    let term_ratio = text::overlap_ratio(query_words, &c.content);
    let mut quality = base + term_ratio * cfg.term_match_weight;
    if term_ratio > 0.0 {
        let hits = (term_ratio * query_words.len() as f32).round() as usize;
        notes.push(format!("{hits}/{} query terms found", query_words.len()));
    }

    if let Some(terms) = input.context_terms.filter(|t| !t.is_empty()) {
        let ctx_ratio = text::overlap_ratio(terms, &c.content);
        quality += ctx_ratio * cfg.context_match_weight;
        if ctx_ratio > 0.0 {
            notes.push("matches conversation context".to_string());
        }
    }

    if c.content.chars().count() < cfg.short_content_chars {
        quality *= cfg.short_content_penalty;
        notes.push("short passage".to_string());
    }

    if !quality.is_finite() {
        tracing::error!("Non-finite quality score for chunk {}", c.chunk_id);
        return Err(SearchError::internal(format!(
            "non-finite quality score for chunk {}",
            c.chunk_id
        )));
    }

    Ok(RankedResult {
        quality_score: quality.clamp(0.0, 1.0),
        explanation: notes.join("; "),
        rerank_score: item.rerank_score,
        candidate: item.candidate,
    })
}

fn describe_base(item: &Shortlisted) -> String {
    let c = &item.candidate;
    if let Some(r) = item.rerank_score {
        return format!("Reranker relevance {r:.2}");
    }
    match (c.vector_score, c.text_score) {
        (Some(v), Some(t)) => format!("Hybrid match (semantic {v:.2}, keyword {t:.2})"),
        (Some(v), None) => format!("Semantic similarity {v:.2}"),
        (None, Some(t)) => format!("Keyword relevance {t:.2}"),
        (None, None) => format!("Score {:.2}", c.fused_score),
    }
}

/// Drop results below the caller's confidence cutoff.
pub fn filter_confidence(results: Vec<RankedResult>, threshold: f32) -> Vec<RankedResult> {
    results
        .into_iter()
        .filter(|r| r.quality_score >= threshold)
        .collect()
}

/// Stable descending sort on quality score; ties keep the incoming (fusion) order.
pub fn sort_by_quality(results: &mut [RankedResult]) {
    results.sort_by(|a, b| {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
