//! The search engine: one query through expansion, retrieval, fusion,
//! reranking, quality scoring and faceting.
//!
//! ```text
//! received → expanding → retrieving → fusing → (reranking) → scoring → faceting → responded
//!                            ▲            │
//!                            └────────────┘ fallback-retry, at most once, on zero candidates
//! ```
//!
//! Any collaborator failure during retrieval ends the search with an error.
//! Reranker failure does not: the fused order is kept.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::try_join_all;

use crate::config::{ScoringConfig, DEFAULT_FALLBACK_THRESHOLD};
use crate::error::{Result, SearchError};
use crate::models::{
    Candidate, ChatMessage, OwnerScope, Query, SearchOptions, SearchResponse, SearchTiming,
    SearchType, MAX_LIMIT,
};
use crate::search::cache::{cache_key, ResultCache};
use crate::search::expansion::{self, HeuristicExpander, QueryExpander};
use crate::search::facets::{apply_facets, resolve_documents, DocumentIndex};
use crate::search::hybrid::{merge_variant_hits, sort_by_fused, weighted_fusion, FusionWeights};
use crate::search::metrics::{MetricsSink, NoopMetricsSink, SearchMetrics};
use crate::search::multi_step::{self, Accumulator, RoundSummary, StopReason};
use crate::search::rerank::{rerank_candidates, Reranker, Shortlisted};
use crate::search::scoring::{filter_confidence, score_candidates, sort_by_quality, ScoringInput};
use crate::search::suggest::empty_result_suggestions;
use crate::search::{text, DocumentMetadata, LexicalSearch, RetrievalOptions, VectorSearch};

/// Retrieval, ranking and filtering over injected collaborators.
///
/// Holds no per-query state; one engine serves concurrent searches.
pub struct SearchEngine {
    vector: Arc<dyn VectorSearch>,
    lexical: Option<Arc<dyn LexicalSearch>>,
    reranker: Option<Arc<dyn Reranker>>,
    metadata: Option<Arc<dyn DocumentMetadata>>,
    cache: Option<Arc<dyn ResultCache>>,
    metrics: Arc<dyn MetricsSink>,
    expander: Arc<dyn QueryExpander>,
    scoring: ScoringConfig,
    fallback_threshold: f32,
}

pub struct SearchEngineBuilder {
    engine: SearchEngine,
}

impl SearchEngineBuilder {
    /// Enables hybrid search. Multi-step rounds also become hybrid.
    pub fn lexical(mut self, lexical: Arc<dyn LexicalSearch>) -> Self {
        self.engine.lexical = Some(lexical);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.engine.reranker = Some(reranker);
        self
    }

    /// Required for date-range and document-type facets.
    pub fn metadata(mut self, metadata: Arc<dyn DocumentMetadata>) -> Self {
        self.engine.metadata = Some(metadata);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.engine.cache = Some(cache);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.engine.metrics = metrics;
        self
    }

    pub fn expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.engine.expander = expander;
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.engine.scoring = scoring;
        self
    }

    pub fn fallback_threshold(mut self, threshold: f32) -> Self {
        self.engine.fallback_threshold = threshold;
        self
    }

    pub fn build(self) -> SearchEngine {
        self.engine
    }
}

/// Candidates produced by the retrieval stage, already fused and sorted.
struct Retrieved {
    candidates: Vec<Candidate>,
    steps: usize,
}

impl Retrieved {
    fn single(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            steps: 1,
        }
    }
}

/// The trailing turns of the conversation that context-aware search and
/// scoring look at.
struct ConversationContext {
    text: String,
    terms: Vec<String>,
}

impl ConversationContext {
    fn from_history(history: &[ChatMessage], window: usize) -> Self {
        let start = history.len().saturating_sub(window);
        let text = history[start..]
            .iter()
            .map(|m| m.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let terms = text::keywords(&text, 3);
        Self { text, terms }
    }
}

impl SearchEngine {
    pub fn builder(vector: Arc<dyn VectorSearch>) -> SearchEngineBuilder {
        SearchEngineBuilder {
            engine: SearchEngine {
                vector,
                lexical: None,
                reranker: None,
                metadata: None,
                cache: None,
                metrics: Arc::new(NoopMetricsSink),
                expander: Arc::new(HeuristicExpander),
                scoring: ScoringConfig::default(),
                fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
            },
        }
    }

    /// Run one search. An empty result set is a normal response; errors mean
    /// the request was invalid or the search could not be carried out.
    pub async fn search(
        &self,
        query: &Query,
        owner: &OwnerScope,
        search_type: SearchType,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        let start = Instant::now();
        let outcome = self.run(query, owner, search_type, options, start).await;

        match &outcome {
            Ok(resp) => self.metrics.record(&SearchMetrics {
                search_type,
                result_count: resp.results.len(),
                total_candidates: resp.total_candidates,
                cache_hit: resp.cache_hit,
                fallback_attempted: resp.fallback_attempted,
                search_ms: resp.timing.search_ms,
                rerank_ms: resp.timing.rerank_ms,
                total_ms: resp.timing.total_ms,
                error: None,
            }),
            Err(e) => {
                tracing::warn!(search_type = %search_type, "Search failed: {e}");
                self.metrics.record(&SearchMetrics {
                    search_type,
                    result_count: 0,
                    total_candidates: 0,
                    cache_hit: false,
                    fallback_attempted: false,
                    search_ms: 0,
                    rerank_ms: 0,
                    total_ms: start.elapsed().as_millis() as u64,
                    error: Some(e.kind()),
                });
            }
        }
        outcome
    }

    async fn run(
        &self,
        query: &Query,
        owner: &OwnerScope,
        search_type: SearchType,
        options: &SearchOptions,
        start: Instant,
    ) -> Result<SearchResponse> {
        tracing::debug!(stage = "received", search_type = %search_type, query = query.text());
        options.validate()?;
        query.facets.validate()?;

        let key = match (&self.cache, options.use_cache) {
            (Some(_), true) => cache_key(query, owner, search_type, options),
            _ => None,
        };
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(mut cached) = cache.get(key) {
                tracing::debug!(
                    stage = "responded",
                    cache_hit = true,
                    results = cached.results.len()
                );
                cached.cache_hit = true;
                cached.timing = SearchTiming {
                    total_ms: start.elapsed().as_millis() as u64,
                    ..Default::default()
                };
                return Ok(cached);
            }
        }

        // ── Expansion ────────────────────────────────────────
        tracing::debug!(stage = "expanding", enabled = options.expand_query);
        let raw_variants = if options.expand_query {
            self.expander.expand(query.text()).await
        } else {
            Vec::new()
        };
        let queries = expansion::merge_variants(query.text(), raw_variants);
        if queries.len() > 1 {
            tracing::info!("Query expanded: {:?}", &queries[1..]);
        }

        let context = ConversationContext::from_history(&query.history, options.context_window);

        // ── Retrieval, with one low-threshold retry ──────────
        let search_start = Instant::now();
        let mut retrieval = retrieval_options(query, options);
        tracing::debug!(
            stage = "retrieving",
            threshold = retrieval.threshold,
            limit = retrieval.limit
        );
        let mut retrieved = self
            .retrieve(query, owner, search_type, options, &queries, &context, &retrieval)
            .await?;

        let mut fallback_attempted = false;
        if retrieved.candidates.is_empty() {
            fallback_attempted = true;
            retrieval.threshold = self.fallback_threshold.min(options.threshold);
            tracing::info!(
                "No candidates at threshold {:.2}, retrying at {:.2} without reranking",
                options.threshold,
                retrieval.threshold
            );
            tracing::debug!(stage = "fallback-retry", threshold = retrieval.threshold);
            retrieved = self
                .retrieve(query, owner, search_type, options, &queries, &context, &retrieval)
                .await?;
        }
        let search_ms = search_start.elapsed().as_millis() as u64;
        let steps = retrieved.steps;

        // ── Reranking ────────────────────────────────────────
        let rerank_start = Instant::now();
        let rerank = !fallback_attempted
            && options.rerank_enabled(search_type)
            && !retrieved.candidates.is_empty();
        let shortlisted: Vec<Shortlisted> = match (&self.reranker, rerank) {
            (Some(reranker), true) => {
                let top_k = options.effective_rerank_top_k();
                tracing::debug!(
                    stage = "reranking",
                    top_k,
                    candidates = retrieved.candidates.len()
                );
                let outcome =
                    rerank_candidates(reranker.as_ref(), query.text(), retrieved.candidates, top_k)
                        .await;
                if outcome.applied {
                    tracing::info!("Re-ranking applied to {} results", outcome.results.len());
                }
                outcome.results
            }
            (None, true) => {
                tracing::debug!("Reranking requested but no reranker is configured");
                retrieved.candidates.into_iter().map(Shortlisted::from).collect()
            }
            (_, false) => retrieved.candidates.into_iter().map(Shortlisted::from).collect(),
        };
        let rerank_ms = rerank_start.elapsed().as_millis() as u64;

        // ── Scoring ──────────────────────────────────────────
        let total_candidates = shortlisted.len();
        tracing::debug!(stage = "scoring", candidates = total_candidates);
        let context_terms = (!query.history.is_empty()).then_some(context.terms.as_slice());
        let scored = score_candidates(
            shortlisted,
            &ScoringInput {
                query: query.text(),
                context_terms,
                config: &self.scoring,
            },
        )?;
        let confident = filter_confidence(scored, options.confidence_threshold);

        // ── Faceting ─────────────────────────────────────────
        tracing::debug!(stage = "faceting", candidates = confident.len());
        let documents = if query.facets.needs_document_metadata() && !confident.is_empty() {
            let store = self.metadata.as_deref().ok_or_else(|| {
                SearchError::unavailable("metadata", "no document metadata store configured")
            })?;
            resolve_documents(store, &query.facets, &confident).await?
        } else {
            DocumentIndex::new()
        };
        let mut results = apply_facets(confident, &query.facets, &documents);
        sort_by_quality(&mut results);
        let filtered_count = results.len();
        results.truncate(options.limit);

        let suggestions = if results.is_empty() {
            empty_result_suggestions(query, search_type, options)
        } else {
            Vec::new()
        };

        let response = SearchResponse {
            query: query.text().to_string(),
            search_type,
            results,
            total_candidates,
            filtered_count,
            timing: SearchTiming {
                search_ms,
                rerank_ms,
                total_ms: start.elapsed().as_millis() as u64,
            },
            cache_hit: false,
            fallback_attempted,
            suggestions,
            expanded_queries: queries,
            steps,
        };
        tracing::debug!(
            stage = "responded",
            results = response.results.len(),
            filtered = filtered_count
        );

        if !response.results.is_empty() {
            if let (Some(cache), Some(key)) = (&self.cache, &key) {
                cache.put(key, response.clone());
            }
        }
        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    async fn retrieve(
        &self,
        query: &Query,
        owner: &OwnerScope,
        search_type: SearchType,
        options: &SearchOptions,
        queries: &[String],
        context: &ConversationContext,
        retrieval: &RetrievalOptions,
    ) -> Result<Retrieved> {
        let weights = FusionWeights {
            vector: options.vector_weight,
            text: options.text_weight,
        };

        match search_type {
            SearchType::Vector => Ok(Retrieved::single(
                self.vector_round(queries, owner, retrieval).await?,
            )),
            SearchType::Hybrid => {
                let lexical = self.lexical.as_deref().ok_or_else(|| {
                    SearchError::unavailable("lexical", "no lexical search backend configured")
                })?;
                Ok(Retrieved::single(
                    self.hybrid_round(lexical, queries, owner, retrieval, weights)
                        .await?,
                ))
            }
            SearchType::ContextAware => {
                let mut augmented = queries.to_vec();
                if let Some(first) = augmented.first_mut() {
                    if !context.text.is_empty() {
                        *first = format!("{first} {}", context.text);
                    }
                }
                let mut hits = self.vector_round(&augmented, owner, retrieval).await?;
                apply_context_boost(&mut hits, &context.terms, options.context_weight);
                sort_by_fused(&mut hits)?;
                Ok(Retrieved::single(hits))
            }
            SearchType::MultiStep => {
                self.multi_step(query, owner, options, queries, retrieval, weights)
                    .await
            }
        }
    }

    /// Vector search for every query variant, merged.
    async fn vector_round(
        &self,
        queries: &[String],
        owner: &OwnerScope,
        retrieval: &RetrievalOptions,
    ) -> Result<Vec<Candidate>> {
        let outputs =
            try_join_all(queries.iter().map(|q| self.vector.search(q, owner, retrieval))).await?;
        let mut hits = merge_variant_hits(outputs.into_iter().map(|o| o.results).collect());
        sort_by_fused(&mut hits)?;
        Ok(hits)
    }

    /// Vector and lexical search run concurrently; fusion waits for both.
    async fn hybrid_round(
        &self,
        lexical: &dyn LexicalSearch,
        queries: &[String],
        owner: &OwnerScope,
        retrieval: &RetrievalOptions,
        weights: FusionWeights,
    ) -> Result<Vec<Candidate>> {
        let vector_lists =
            try_join_all(queries.iter().map(|q| self.vector.search(q, owner, retrieval)));
        let text_lists = try_join_all(queries.iter().map(|q| lexical.search(q, owner, retrieval)));
        let (vector_lists, text_lists) = tokio::try_join!(vector_lists, text_lists)?;

        let vector_hits = merge_variant_hits(vector_lists.into_iter().map(|o| o.results).collect());
        let text_hits = merge_variant_hits(text_lists.into_iter().map(|o| o.results).collect());
        tracing::debug!(
            stage = "fusing",
            vector = vector_hits.len(),
            text = text_hits.len()
        );
        weighted_fusion(vector_hits, text_hits, weights)
    }

    /// Sequential rounds, each refining the next from its best results.
    async fn multi_step(
        &self,
        query: &Query,
        owner: &OwnerScope,
        options: &SearchOptions,
        queries: &[String],
        retrieval: &RetrievalOptions,
        weights: FusionWeights,
    ) -> Result<Retrieved> {
        let mut acc = Accumulator::default();
        let mut asked: HashSet<String> = queries.iter().map(|q| multi_step::normalize(q)).collect();
        let mut round_queries = queries.to_vec();
        let mut step = 0;

        let reason = loop {
            step += 1;
            tracing::debug!(step, queries = ?round_queries, "multi-step round");
            let hits = match self.lexical.as_deref() {
                Some(lexical) => {
                    self.hybrid_round(lexical, &round_queries, owner, retrieval, weights)
                        .await?
                }
                None => self.vector_round(&round_queries, owner, retrieval).await?,
            };

            let round_results = hits.len();
            let next = multi_step::refine_queries(query.text(), &hits, &mut asked);
            let new_candidates = acc.absorb(hits);
            let summary = RoundSummary {
                step,
                round_results,
                new_candidates,
                accumulated: acc.len(),
            };
            if let Some(reason) =
                multi_step::stop_after(&summary, options.max_steps, options.min_results_per_step)
            {
                break reason;
            }
            if next.is_empty() {
                break StopReason::NoRefinement;
            }
            round_queries = next;
        };

        tracing::debug!(
            steps = step,
            reason = reason.as_str(),
            candidates = acc.len(),
            "multi-step search finished"
        );
        let mut candidates = acc.into_candidates();
        sort_by_fused(&mut candidates)?;
        Ok(Retrieved {
            candidates,
            steps: step,
        })
    }
}

/// Options for each backend call. Fetches more than `limit` so reranking,
/// confidence filtering and faceting still leave a full page. Element-type
/// and page facets are pushed down as well; they are re-checked post-hoc.
fn retrieval_options(query: &Query, options: &SearchOptions) -> RetrievalOptions {
    let limit = (options.limit * 2)
        .max(options.effective_rerank_top_k())
        .min(MAX_LIMIT);

    let mut page_numbers = query.facets.page_numbers.clone();
    if let Some(spatial) = &query.facets.spatial_search {
        page_numbers = Some(match page_numbers {
            Some(pages) => pages
                .into_iter()
                .filter(|p| *p == spatial.page_number)
                .collect(),
            None => vec![spatial.page_number],
        });
    }

    RetrievalOptions {
        limit,
        threshold: options.threshold,
        document_ids: query.document_ids.clone(),
        element_types: query.facets.element_types.clone(),
        page_numbers,
    }
}

/// Additive boost `weight * overlap_ratio` for candidates mentioning context terms.
fn apply_context_boost(hits: &mut [Candidate], terms: &[String], weight: f32) {
    if terms.is_empty() || weight <= 0.0 {
        return;
    }
    for c in hits.iter_mut() {
        let ratio = text::overlap_ratio(terms, &c.content);
        if ratio > 0.0 {
            c.fused_score = (c.fused_score + weight * ratio).min(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, ChunkRecord, DocumentMeta, FacetFilter, SpatialFilter};
    use crate::search::cache::MemoryResultCache;
    use crate::search::rerank::RerankScore;
    use crate::search::RetrievalOutput;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    const FILLER: &str = "This section walks through the procedure in detail, including the \
                          tools required and the checks to perform once it is complete.";

    fn cand(content: &str, score: f32, page: Option<u32>) -> Candidate {
        let chunk = ChunkRecord {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::nil(),
            owner_id: "alice".to_string(),
            content: content.to_string(),
            page_number: page,
            element_type: Some("NarrativeText".to_string()),
            bbox: Some(BoundingBox::new(10.0, 10.0, 50.0, 50.0).unwrap()),
        };
        Candidate::from_vector(&chunk, score)
    }

    fn as_lexical(c: &Candidate, score: f32) -> Candidate {
        Candidate {
            vector_score: None,
            text_score: Some(score),
            fused_score: score,
            ..c.clone()
        }
    }

    /// Returns its fixed hits above the requested threshold, recording each call.
    #[derive(Default)]
    struct FakeBackend {
        hits: Vec<Candidate>,
        calls: Mutex<Vec<(String, f32)>>,
    }

    impl FakeBackend {
        fn new(hits: Vec<Candidate>) -> Arc<Self> {
            Arc::new(Self {
                hits,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn respond(&self, query: &str, options: &RetrievalOptions) -> RetrievalOutput {
            self.calls.lock().push((query.to_string(), options.threshold));
            let mut results: Vec<Candidate> = self
                .hits
                .iter()
                .filter(|c| c.fused_score >= options.threshold)
                .cloned()
                .collect();
            let total_results = results.len();
            results.truncate(options.limit);
            RetrievalOutput {
                results,
                total_results,
                ..Default::default()
            }
        }

        fn thresholds(&self) -> Vec<f32> {
            self.calls.lock().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl VectorSearch for FakeBackend {
        async fn search(
            &self,
            query: &str,
            _: &OwnerScope,
            options: &RetrievalOptions,
        ) -> Result<RetrievalOutput> {
            Ok(self.respond(query, options))
        }
    }

    #[async_trait]
    impl LexicalSearch for FakeBackend {
        async fn search(
            &self,
            query: &str,
            _: &OwnerScope,
            options: &RetrievalOptions,
        ) -> Result<RetrievalOutput> {
            Ok(self.respond(query, options))
        }
    }

    /// First call for the original query returns `first`, everything else `rest`.
    struct RoundBackend {
        original: String,
        first: Vec<Candidate>,
        rest: Vec<Candidate>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorSearch for RoundBackend {
        async fn search(
            &self,
            query: &str,
            _: &OwnerScope,
            _: &RetrievalOptions,
        ) -> Result<RetrievalOutput> {
            self.calls.lock().push(query.to_string());
            let results = if query == self.original {
                self.first.clone()
            } else {
                self.rest.clone()
            };
            Ok(RetrievalOutput {
                total_results: results.len(),
                results,
                ..Default::default()
            })
        }
    }

    struct FailingVector;

    #[async_trait]
    impl VectorSearch for FailingVector {
        async fn search(
            &self,
            _: &str,
            _: &OwnerScope,
            _: &RetrievalOptions,
        ) -> Result<RetrievalOutput> {
            Err(SearchError::unavailable("embedding", "connection refused"))
        }
    }

    /// Reverses the shortlist order.
    #[derive(Default)]
    struct ReversingReranker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(
            &self,
            _: &str,
            documents: &[String],
            top_k: usize,
        ) -> Result<Vec<RerankScore>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..documents.len())
                .rev()
                .enumerate()
                .take(top_k)
                .map(|(rank, index)| RerankScore {
                    index,
                    score: 0.95 - rank as f32 * 0.05,
                })
                .collect())
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(&self, _: &str, _: &[String], _: usize) -> Result<Vec<RerankScore>> {
            Err(SearchError::unavailable("reranker", "timeout"))
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        records: Mutex<Vec<SearchMetrics>>,
    }

    impl MetricsSink for RecordingMetrics {
        fn record(&self, metrics: &SearchMetrics) {
            self.records.lock().push(metrics.clone());
        }
    }

    struct FixedMetadata(Vec<DocumentMeta>);

    #[async_trait]
    impl DocumentMetadata for FixedMetadata {
        async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<DocumentMeta>> {
            Ok(self.0.iter().filter(|d| ids.contains(&d.id)).cloned().collect())
        }
    }

    fn owner() -> OwnerScope {
        OwnerScope::new("alice")
    }

    fn installation_hits(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| {
                cand(
                    &format!("Installation steps, part {i}. {FILLER}"),
                    0.95 - i as f32 * 0.05,
                    Some(1),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_hybrid_installation_scenario() {
        let vector_hits = installation_hits(12);
        let text_hits = vec![
            as_lexical(&vector_hits[3], 0.8),
            as_lexical(&vector_hits[7], 0.6),
            as_lexical(&cand(&format!("Installation checklist. {FILLER}"), 0.0, Some(2)), 0.5),
        ];
        let vector = FakeBackend::new(vector_hits);
        let lexical = FakeBackend::new(text_hits);
        let reranker = Arc::new(ReversingReranker::default());
        let engine = SearchEngine::builder(vector.clone())
            .lexical(lexical.clone())
            .reranker(reranker.clone())
            .build();

        let options = SearchOptions {
            limit: 8,
            threshold: 0.3,
            vector_weight: 0.7,
            text_weight: 0.3,
            ..Default::default()
        };
        let query = Query::new("installation steps").unwrap();
        let resp = engine
            .search(&query, &owner(), SearchType::Hybrid, &options)
            .await
            .unwrap();

        assert!(resp.results.len() <= 8);
        assert!(!resp.results.is_empty());
        assert_eq!(reranker.calls.load(Ordering::SeqCst), 1);
        for r in &resp.results {
            assert!(r.candidate.fused_score >= 0.3 || r.rerank_score.is_some());
            assert!((0.0..=1.0).contains(&r.quality_score));
        }
        assert!(!resp.fallback_attempted);
        assert!(!resp.cache_hit);
        assert_eq!(resp.steps, 1);
        assert_eq!(vector.thresholds(), vec![0.3]);
        assert_eq!(lexical.thresholds(), vec![0.3]);
    }

    #[tokio::test]
    async fn test_fused_score_is_weighted_sum() {
        let both = cand(&format!("Pump calibration. {FILLER}"), 0.6, None);
        let vector = FakeBackend::new(vec![both.clone()]);
        let lexical = FakeBackend::new(vec![as_lexical(&both, 0.9)]);
        let engine = SearchEngine::builder(vector).lexical(lexical).build();

        let resp = engine
            .search(
                &Query::new("pump calibration").unwrap(),
                &owner(),
                SearchType::Hybrid,
                &SearchOptions::default(),
            )
            .await
            .unwrap();
        let c = &resp.results[0].candidate;
        assert!((c.fused_score - (0.7 * 0.6 + 0.3 * 0.9)).abs() < 1e-6);
        assert_eq!(c.vector_score, Some(0.6));
        assert_eq!(c.text_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_fallback_retries_once_at_low_threshold_without_rerank() {
        let vector = FakeBackend::new(vec![cand(&format!("Pump manual. {FILLER}"), 0.2, None)]);
        let reranker = Arc::new(ReversingReranker::default());
        let engine = SearchEngine::builder(vector.clone())
            .reranker(reranker.clone())
            .build();

        let options = SearchOptions {
            rerank: Some(true),
            confidence_threshold: 0.0,
            ..Default::default()
        };
        let resp = engine
            .search(&Query::new("pump").unwrap(), &owner(), SearchType::Vector, &options)
            .await
            .unwrap();

        assert!(resp.fallback_attempted);
        assert_eq!(resp.results.len(), 1);
        assert_eq!(vector.thresholds(), vec![0.3, 0.1]);
        assert_eq!(reranker.calls.load(Ordering::SeqCst), 0);
        assert!(resp.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_empty_after_fallback_returns_suggestions() {
        let vector = FakeBackend::new(Vec::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let engine = SearchEngine::builder(vector.clone())
            .metrics(metrics.clone())
            .build();

        let resp = engine
            .search(
                &Query::new("quantum flux capacitor").unwrap(),
                &owner(),
                SearchType::Vector,
                &SearchOptions::default(),
            )
            .await
            .unwrap();

        assert!(resp.results.is_empty());
        assert!(resp.fallback_attempted);
        assert!(!resp.suggestions.is_empty());
        // Exactly one retry
        assert_eq!(vector.thresholds().len(), 2);
        let records = metrics.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].fallback_attempted);
        assert_eq!(records[0].error, None);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_an_error_not_empty() {
        let metrics = Arc::new(RecordingMetrics::default());
        let engine = SearchEngine::builder(Arc::new(FailingVector))
            .metrics(metrics.clone())
            .build();
        let err = engine
            .search(
                &Query::new("pump").unwrap(),
                &owner(),
                SearchType::Vector,
                &SearchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");
        assert_eq!(metrics.records.lock()[0].error, Some("service_unavailable"));
    }

    #[tokio::test]
    async fn test_reranker_failure_keeps_fused_order() {
        let hits = installation_hits(4);
        let ids: Vec<Uuid> = hits.iter().map(|c| c.chunk_id).collect();
        let engine = SearchEngine::builder(FakeBackend::new(hits))
            .lexical(FakeBackend::new(Vec::new()))
            .reranker(Arc::new(FailingReranker))
            .build();

        let resp = engine
            .search(
                &Query::new("installation steps").unwrap(),
                &owner(),
                SearchType::Hybrid,
                &SearchOptions::default(),
            )
            .await
            .unwrap();
        let order: Vec<Uuid> = resp.results.iter().map(|r| r.candidate.chunk_id).collect();
        assert_eq!(order, ids);
        assert!(resp.results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_spatial_facet_requires_exact_page() {
        let on_page_two = cand(&format!("Wiring diagram. {FILLER}"), 0.8, Some(2));
        let on_page_three = cand(&format!("Wiring diagram. {FILLER}"), 0.9, Some(3));
        let keep = on_page_two.chunk_id;
        let engine =
            SearchEngine::builder(FakeBackend::new(vec![on_page_three, on_page_two])).build();

        let query = Query::new("wiring diagram").unwrap().with_facets(FacetFilter {
            spatial_search: Some(SpatialFilter {
                page_number: 2,
                bbox: BoundingBox::new(0.0, 0.0, 100.0, 100.0).unwrap(),
            }),
            ..Default::default()
        });
        let resp = engine
            .search(&query, &owner(), SearchType::Vector, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].candidate.chunk_id, keep);
        assert_eq!(resp.filtered_count, 1);
        assert_eq!(resp.total_candidates, 2);
    }

    #[tokio::test]
    async fn test_document_type_facet_needs_metadata_store() {
        let hit = cand(&format!("Warranty terms. {FILLER}"), 0.8, None);
        let query = Query::new("warranty").unwrap().with_facets(FacetFilter {
            document_types: Some(vec!["pdf".to_string()]),
            ..Default::default()
        });

        let engine = SearchEngine::builder(FakeBackend::new(vec![hit.clone()])).build();
        let err = engine
            .search(&query, &owner(), SearchType::Vector, &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");

        let meta = DocumentMeta {
            id: hit.document_id,
            owner_id: "alice".to_string(),
            original_name: "warranty.pdf".to_string(),
            document_type: Some("pdf".to_string()),
            created_at: chrono::Utc::now(),
        };
        let engine = SearchEngine::builder(FakeBackend::new(vec![hit]))
            .metadata(Arc::new(FixedMetadata(vec![meta])))
            .build();
        let resp = engine
            .search(&query, &owner(), SearchType::Vector, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
    }

    #[tokio::test]
    async fn test_confidence_threshold_drops_weak_results() {
        let strong = cand(&format!("Torque settings. {FILLER}"), 0.9, None);
        let weak = cand(&format!("Unrelated appendix. {FILLER}"), 0.35, None);
        let engine = SearchEngine::builder(FakeBackend::new(vec![strong.clone(), weak])).build();
        let options = SearchOptions {
            confidence_threshold: 0.6,
            ..Default::default()
        };
        let resp = engine
            .search(&Query::new("torque settings").unwrap(), &owner(), SearchType::Vector, &options)
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].candidate.chunk_id, strong.chunk_id);
        assert_eq!(resp.total_candidates, 2);
        assert_eq!(resp.filtered_count, 1);
    }

    #[tokio::test]
    async fn test_context_aware_boosts_overlap() {
        let generic = cand(&format!("General cleaning guidance. {FILLER}"), 0.5, None);
        let related = cand(
            &format!("Replace the seal when the hydraulic pump is leaking. {FILLER}"),
            0.5,
            None,
        );
        let related_id = related.chunk_id;
        let vector = FakeBackend::new(vec![generic, related]);
        let engine = SearchEngine::builder(vector.clone()).build();

        let query = Query::new("how do I fix it").unwrap().with_history(vec![ChatMessage {
            role: "user".to_string(),
            content: "the hydraulic pump keeps leaking".to_string(),
        }]);
        let resp = engine
            .search(&query, &owner(), SearchType::ContextAware, &SearchOptions::default())
            .await
            .unwrap();

        let top = &resp.results[0].candidate;
        assert_eq!(top.chunk_id, related_id);
        // hydraulic, pump, leaking out of 4 context keywords
        assert!((top.fused_score - (0.5 + 0.2 * 0.75)).abs() < 1e-6);
        let (sent, _) = vector.calls.lock()[0].clone();
        assert!(sent.contains("hydraulic pump keeps leaking"));
    }

    #[tokio::test]
    async fn test_multi_step_stops_when_enough_accumulated() {
        let original = "pump installation";
        let first: Vec<Candidate> = (0..5)
            .map(|i| {
                cand(
                    &format!(
                        "Mount the bracket firmly, then connect the hydraulic hoses. Step {i}."
                    ),
                    0.8,
                    None,
                )
            })
            .collect();
        let rest: Vec<Candidate> = (0..5)
            .map(|i| cand(&format!("Bracket torque values, table {i}."), 0.7, None))
            .collect();
        let vector = Arc::new(RoundBackend {
            original: original.to_string(),
            first,
            rest,
            calls: Mutex::new(Vec::new()),
        });
        let engine = SearchEngine::builder(vector.clone()).build();

        let options = SearchOptions {
            max_steps: 3,
            min_results_per_step: 3,
            confidence_threshold: 0.0,
            ..Default::default()
        };
        let resp = engine
            .search(&Query::new(original).unwrap(), &owner(), SearchType::MultiStep, &options)
            .await
            .unwrap();

        assert_eq!(resp.steps, 2);
        assert_eq!(resp.total_candidates, 10);
        // Identical round-1 contents collapse into one refined sub-query
        assert_eq!(vector.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_multi_step_stops_when_round_adds_nothing() {
        let original = "pump installation";
        let first: Vec<Candidate> = (0..4)
            .map(|i| cand(&format!("Mount the bracket firmly. Step {i}."), 0.8, None))
            .collect();
        let vector = Arc::new(RoundBackend {
            original: original.to_string(),
            first: first.clone(),
            rest: first,
            calls: Mutex::new(Vec::new()),
        });
        let engine = SearchEngine::builder(vector.clone()).build();
        let options = SearchOptions {
            max_steps: 5,
            confidence_threshold: 0.0,
            ..Default::default()
        };
        let resp = engine
            .search(&Query::new(original).unwrap(), &owner(), SearchType::MultiStep, &options)
            .await
            .unwrap();
        assert_eq!(resp.steps, 2);
        assert_eq!(resp.total_candidates, 4);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_retrieval() {
        let vector = FakeBackend::new(installation_hits(3));
        let cache = Arc::new(MemoryResultCache::new(100, Duration::from_secs(60)));
        let engine = SearchEngine::builder(vector.clone()).cache(cache).build();
        let query = Query::new("installation steps").unwrap();
        let options = SearchOptions::default();

        let first = engine
            .search(&query, &owner(), SearchType::Vector, &options)
            .await
            .unwrap();
        let second = engine
            .search(&query, &owner(), SearchType::Vector, &options)
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.results, second.results);
        assert_eq!(vector.thresholds().len(), 1);

        // Opting out bypasses the cache
        let no_cache = SearchOptions {
            use_cache: false,
            ..Default::default()
        };
        let third = engine
            .search(&query, &owner(), SearchType::Vector, &no_cache)
            .await
            .unwrap();
        assert!(!third.cache_hit);
        assert_eq!(vector.thresholds().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_responses_are_not_cached() {
        let vector = FakeBackend::new(Vec::new());
        let cache = Arc::new(MemoryResultCache::new(100, Duration::from_secs(60)));
        let engine = SearchEngine::builder(vector.clone()).cache(cache).build();
        let query = Query::new("nothing here").unwrap();
        for _ in 0..2 {
            let resp = engine
                .search(&query, &owner(), SearchType::Vector, &SearchOptions::default())
                .await
                .unwrap();
            assert!(!resp.cache_hit);
        }
        assert_eq!(vector.thresholds().len(), 4);
    }

    #[tokio::test]
    async fn test_bad_weights_rejected_before_retrieval() {
        let vector = FakeBackend::new(installation_hits(2));
        let engine = SearchEngine::builder(vector.clone())
            .lexical(FakeBackend::new(Vec::new()))
            .build();
        let options = SearchOptions {
            vector_weight: 0.9,
            text_weight: 0.3,
            ..Default::default()
        };
        let err = engine
            .search(&Query::new("q").unwrap(), &owner(), SearchType::Hybrid, &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "bad_request");
        assert!(vector.thresholds().is_empty());
    }

    #[tokio::test]
    async fn test_hybrid_without_lexical_backend_is_unavailable() {
        let engine = SearchEngine::builder(FakeBackend::new(installation_hits(2))).build();
        let err = engine
            .search(
                &Query::new("installation").unwrap(),
                &owner(),
                SearchType::Hybrid,
                &SearchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");
    }

    #[tokio::test]
    async fn test_non_finite_score_is_internal_error() {
        let backend = FakeBackend::new(vec![cand("broken", f32::INFINITY, None)]);
        let engine = SearchEngine::builder(backend).build();
        let err = engine
            .search(
                &Query::new("broken").unwrap(),
                &owner(),
                SearchType::Vector,
                &SearchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn test_expansion_queries_reported() {
        let vector = FakeBackend::new(installation_hits(2));
        let engine = SearchEngine::builder(vector.clone()).build();
        let options = SearchOptions {
            expand_query: true,
            ..Default::default()
        };
        let resp = engine
            .search(
                &Query::new("what are the installation steps").unwrap(),
                &owner(),
                SearchType::Vector,
                &options,
            )
            .await
            .unwrap();
        assert_eq!(resp.expanded_queries[0], "what are the installation steps");
        assert!(resp.expanded_queries.len() > 1);
        assert_eq!(vector.thresholds().len(), resp.expanded_queries.len());
    }

    #[test]
    fn test_retrieval_options_push_down_filters() {
        let query = Query::new("q").unwrap().with_facets(FacetFilter {
            page_numbers: Some(vec![1, 2, 3]),
            spatial_search: Some(SpatialFilter {
                page_number: 2,
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap(),
            }),
            ..Default::default()
        });
        let opts = retrieval_options(&query, &SearchOptions { limit: 30, ..Default::default() });
        assert_eq!(opts.limit, MAX_LIMIT);
        assert_eq!(opts.page_numbers, Some(vec![2]));
    }

    #[test]
    fn test_context_window_takes_trailing_turns() {
        let history: Vec<ChatMessage> = ["alpha", "bravo", "charlie"]
            .iter()
            .map(|c| ChatMessage {
                role: "user".to_string(),
                content: c.to_string(),
            })
            .collect();
        let ctx = ConversationContext::from_history(&history, 2);
        assert_eq!(ctx.text, "bravo charlie");
        assert!(ConversationContext::from_history(&history, 0).text.is_empty());
    }
}
