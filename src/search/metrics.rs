//! Search analytics sink, injected into the engine.

use crate::models::SearchType;

/// Summary of one completed (or failed) search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMetrics {
    pub search_type: SearchType,
    pub result_count: usize,
    pub total_candidates: usize,
    pub cache_hit: bool,
    pub fallback_attempted: bool,
    pub search_ms: u64,
    pub rerank_ms: u64,
    pub total_ms: u64,
    /// Error kind when the search failed.
    pub error: Option<&'static str>,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, metrics: &SearchMetrics);
}

/// Emits one structured log event per search.
#[derive(Debug, Clone, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, m: &SearchMetrics) {
        tracing::info!(
            target: "rag_retrieval::metrics",
            search_type = %m.search_type,
            results = m.result_count,
            candidates = m.total_candidates,
            cache_hit = m.cache_hit,
            fallback = m.fallback_attempted,
            search_ms = m.search_ms,
            rerank_ms = m.rerank_ms,
            total_ms = m.total_ms,
            error = m.error.unwrap_or("none"),
            "search completed"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _metrics: &SearchMetrics) {}
}
