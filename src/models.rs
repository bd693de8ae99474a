use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SearchError};

/// Maximum accepted query length in characters (after trimming).
pub const MAX_QUERY_CHARS: usize = 500;
/// Upper bound on `limit` for a single search.
pub const MAX_LIMIT: usize = 50;
/// Upper bound on `max_steps` for multi-step search.
pub const MAX_STEPS: usize = 5;
/// Allowed deviation of `vector_weight + text_weight` from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f32 = 0.01;

/// Page-space rectangle `[x1, y1, x2, y2]`.
///
/// Every representation coming from a backend or a request is normalized into
/// this type on deserialization; anything that is not exactly four finite,
/// ordered coordinates is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(SearchError::bad_request(
                "bbox coordinates must be finite numbers",
            ));
        }
        if x1 > x2 || y1 > y2 {
            return Err(SearchError::bad_request(
                "bbox must be [x1, y1, x2, y2] with x1 <= x2 and y1 <= y2",
            ));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Two rectangles intersect unless one lies entirely to a side of the other.
    /// Touching edges count as intersecting.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.x2 < other.x1 || self.x1 > other.x2 || self.y2 < other.y1 || self.y1 > other.y2)
    }
}

impl TryFrom<Vec<f64>> for BoundingBox {
    type Error = SearchError;

    fn try_from(coords: Vec<f64>) -> Result<Self> {
        match coords.as_slice() {
            [x1, y1, x2, y2] => Self::new(*x1, *y1, *x2, *y2),
            other => Err(SearchError::bad_request(format!(
                "bbox must have exactly 4 coordinates, got {}",
                other.len()
            ))),
        }
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// A single conversation turn (user or assistant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Identity boundary restricting which chunks a query may see.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope(pub String);

impl OwnerScope {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A validated search query. Immutable for the lifetime of a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    text: String,
    pub history: Vec<ChatMessage>,
    pub document_ids: Option<Vec<Uuid>>,
    pub facets: FacetFilter,
}

impl Query {
    /// Build a query from raw text. The text is trimmed and must be 1-500 chars.
    pub fn new(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SearchError::bad_request("Query is required"));
        }
        let chars = text.chars().count();
        if chars > MAX_QUERY_CHARS {
            return Err(SearchError::bad_request(format!(
                "Query is {chars} characters, maximum is {MAX_QUERY_CHARS}"
            )));
        }
        Ok(Self {
            text: text.to_string(),
            history: Vec::new(),
            document_ids: None,
            facets: FacetFilter::default(),
        })
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_document_ids(mut self, ids: Vec<Uuid>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    pub fn with_facets(mut self, facets: FacetFilter) -> Self {
        self.facets = facets;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Retrieval strategy selected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchType {
    Vector,
    #[default]
    Hybrid,
    ContextAware,
    MultiStep,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Vector => "vector",
            SearchType::Hybrid => "hybrid",
            SearchType::ContextAware => "context-aware",
            SearchType::MultiStep => "multi-step",
        }
    }
}

impl std::fmt::Display for SearchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request knobs for every pipeline stage. `Default` documents the
/// baseline contract; the server overrides it from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    /// Final answer size, 1-50.
    pub limit: usize,
    /// Retrieval similarity cutoff, 0-1.
    pub threshold: f32,
    pub vector_weight: f32,
    pub text_weight: f32,
    /// `None` means "default for the search type" (on for hybrid only).
    pub rerank: Option<bool>,
    /// `None` means `min(2 * limit, 20)`.
    pub rerank_top_k: Option<usize>,
    pub expand_query: bool,
    /// Caller-facing cutoff on quality score, distinct from `threshold`.
    pub confidence_threshold: f32,
    /// Number of trailing history turns used by context-aware search.
    pub context_window: usize,
    /// Additive boost scale for context overlap during context-aware retrieval.
    pub context_weight: f32,
    pub max_steps: usize,
    pub min_results_per_step: usize,
    pub use_cache: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 0.3,
            vector_weight: 0.7,
            text_weight: 0.3,
            rerank: None,
            rerank_top_k: None,
            expand_query: false,
            confidence_threshold: 0.3,
            context_window: 6,
            context_weight: 0.2,
            max_steps: 3,
            min_results_per_step: 3,
            use_cache: true,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(SearchError::bad_request(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        check_unit("threshold", self.threshold)?;
        check_unit("confidenceThreshold", self.confidence_threshold)?;
        check_unit("vectorWeight", self.vector_weight)?;
        check_unit("textWeight", self.text_weight)?;
        check_unit("contextWeight", self.context_weight)?;
        let sum = self.vector_weight + self.text_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(SearchError::bad_request(format!(
                "vectorWeight + textWeight must equal 1.0, got {sum}"
            )));
        }
        if self.max_steps == 0 || self.max_steps > MAX_STEPS {
            return Err(SearchError::bad_request(format!(
                "maxSteps must be between 1 and {MAX_STEPS}"
            )));
        }
        if self.min_results_per_step == 0 {
            return Err(SearchError::bad_request("minResultsPerStep must be at least 1"));
        }
        if self.rerank_top_k == Some(0) {
            return Err(SearchError::bad_request("rerankTopK must be at least 1"));
        }
        Ok(())
    }

    pub fn rerank_enabled(&self, search_type: SearchType) -> bool {
        self.rerank
            .unwrap_or(matches!(search_type, SearchType::Hybrid))
    }

    pub fn effective_rerank_top_k(&self) -> usize {
        self.rerank_top_k.unwrap_or((self.limit * 2).min(20))
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SearchError::bad_request(format!(
            "{name} must be between 0 and 1, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| *at >= from) && self.to.map_or(true, |to| *at <= to)
    }
}

/// Inclusive bounds on chunk content length, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthBounds {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

impl LengthBounds {
    pub fn contains(&self, len: usize) -> bool {
        self.min.map_or(true, |m| len >= m) && self.max.map_or(true, |m| len <= m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialFilter {
    pub page_number: u32,
    pub bbox: BoundingBox,
}

/// Conjunction of optional structural predicates, applied after retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FacetFilter {
    pub date_range: Option<DateRange>,
    pub element_types: Option<Vec<String>>,
    pub page_numbers: Option<Vec<u32>>,
    pub chunk_length: Option<LengthBounds>,
    pub spatial_search: Option<SpatialFilter>,
    pub document_types: Option<Vec<String>>,
}

impl FacetFilter {
    pub fn is_empty(&self) -> bool {
        self == &FacetFilter::default()
    }

    /// Date and document-type predicates need the owning document's metadata.
    pub fn needs_document_metadata(&self) -> bool {
        self.date_range.is_some() || self.document_types.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(range) = &self.date_range {
            if let (Some(from), Some(to)) = (range.from, range.to) {
                if from > to {
                    return Err(SearchError::bad_request(
                        "facets.dateRange.from must not be after facets.dateRange.to",
                    ));
                }
            }
        }
        if let Some(bounds) = &self.chunk_length {
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min > max {
                    return Err(SearchError::bad_request(
                        "facets.chunkLength.min must not exceed facets.chunkLength.max",
                    ));
                }
            }
        }
        if let Some(pages) = &self.page_numbers {
            if pages.iter().any(|p| *p == 0) {
                return Err(SearchError::bad_request("page numbers start at 1"));
            }
        }
        if let Some(spatial) = &self.spatial_search {
            if spatial.page_number == 0 {
                return Err(SearchError::bad_request("page numbers start at 1"));
            }
        }
        for (name, set) in [
            ("elementTypes", &self.element_types),
            ("documentTypes", &self.document_types),
        ] {
            if let Some(values) = set {
                if values.iter().any(|v| v.trim().is_empty()) {
                    return Err(SearchError::bad_request(format!(
                        "facets.{name} must not contain empty values"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A chunk as stored by the retrieval backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub owner_id: String,
    pub content: String,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub element_type: Option<String>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

/// Metadata of an uploaded document, used to resolve date and type facets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub id: Uuid,
    pub owner_id: String,
    pub original_name: String,
    #[serde(default)]
    pub document_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A scored reference to a chunk, produced fresh per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub page_number: Option<u32>,
    pub element_type: Option<String>,
    pub bbox: Option<BoundingBox>,
    pub vector_score: Option<f32>,
    pub text_score: Option<f32>,
    pub fused_score: f32,
}

impl Candidate {
    pub fn from_vector(chunk: &ChunkRecord, score: f32) -> Self {
        Self::from_chunk(chunk, Some(score), None, score)
    }

    pub fn from_lexical(chunk: &ChunkRecord, score: f32) -> Self {
        Self::from_chunk(chunk, None, Some(score), score)
    }

    fn from_chunk(
        chunk: &ChunkRecord,
        vector_score: Option<f32>,
        text_score: Option<f32>,
        fused_score: f32,
    ) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            document_id: chunk.document_id,
            content: chunk.content.clone(),
            page_number: chunk.page_number,
            element_type: chunk.element_type.clone(),
            bbox: chunk.bbox,
            vector_score,
            text_score,
            fused_score,
        }
    }
}

/// A candidate with its final user-facing score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    #[serde(flatten)]
    pub candidate: Candidate,
    /// Always within [0, 1].
    pub quality_score: f32,
    pub explanation: String,
    pub rerank_score: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTiming {
    pub search_ms: u64,
    pub rerank_ms: u64,
    pub total_ms: u64,
}

/// Search response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub search_type: SearchType,
    /// Rank order, best first.
    pub results: Vec<RankedResult>,
    /// Candidates entering scoring, before confidence and facet filtering.
    pub total_candidates: usize,
    /// Candidates surviving confidence and facet filtering, before truncation.
    pub filtered_count: usize,
    pub timing: SearchTiming,
    pub cache_hit: bool,
    pub fallback_attempted: bool,
    pub suggestions: Vec<String>,
    pub expanded_queries: Vec<String>,
    /// Retrieval rounds executed (always 1 outside multi-step search).
    pub steps: usize,
}

/// Search request as received over HTTP. Unset options fall back to the
/// server's configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub search_type: SearchType,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    pub document_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub facets: FacetFilter,
    pub limit: Option<usize>,
    pub threshold: Option<f32>,
    pub vector_weight: Option<f32>,
    pub text_weight: Option<f32>,
    pub rerank: Option<bool>,
    pub rerank_top_k: Option<usize>,
    pub expand_query: Option<bool>,
    pub confidence_threshold: Option<f32>,
    pub context_window: Option<usize>,
    pub context_weight: Option<f32>,
    pub max_steps: Option<usize>,
    pub min_results_per_step: Option<usize>,
    pub use_cache: Option<bool>,
}

impl SearchRequest {
    /// Validate and split into the pipeline's inputs.
    pub fn into_parts(
        self,
        defaults: &SearchOptions,
    ) -> Result<(Query, SearchType, SearchOptions)> {
        let mut options = defaults.clone();
        if let Some(v) = self.limit {
            options.limit = v;
        }
        if let Some(v) = self.threshold {
            options.threshold = v;
        }
        // Supplying one weight implies the other.
        match (self.vector_weight, self.text_weight) {
            (Some(v), Some(t)) => {
                options.vector_weight = v;
                options.text_weight = t;
            }
            (Some(v), None) => {
                options.vector_weight = v;
                options.text_weight = 1.0 - v;
            }
            (None, Some(t)) => {
                options.vector_weight = 1.0 - t;
                options.text_weight = t;
            }
            (None, None) => {}
        }
        if self.rerank.is_some() {
            options.rerank = self.rerank;
        }
        if self.rerank_top_k.is_some() {
            options.rerank_top_k = self.rerank_top_k;
        }
        if let Some(v) = self.expand_query {
            options.expand_query = v;
        }
        if let Some(v) = self.confidence_threshold {
            options.confidence_threshold = v;
        }
        if let Some(v) = self.context_window {
            options.context_window = v;
        }
        if let Some(v) = self.context_weight {
            options.context_weight = v;
        }
        if let Some(v) = self.max_steps {
            options.max_steps = v;
        }
        if let Some(v) = self.min_results_per_step {
            options.min_results_per_step = v;
        }
        if let Some(v) = self.use_cache {
            options.use_cache = v;
        }
        options.validate()?;
        self.facets.validate()?;

        let mut query = Query::new(&self.query)?
            .with_history(self.history)
            .with_facets(self.facets);
        // An empty allowlist from a client means "no selection", not "nothing"
        if let Some(ids) = self.document_ids.filter(|ids| !ids.is_empty()) {
            query = query.with_document_ids(ids);
        }
        Ok((query, self.search_type, options))
    }
}

/// Index request: a document's metadata plus its pre-extracted chunks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocumentRequest {
    pub original_name: String,
    pub document_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub chunks: Vec<IndexChunk>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexChunk {
    pub content: String,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub element_type: Option<String>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

/// Response for a successfully indexed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocumentResponse {
    pub document: DocumentMeta,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub documents: usize,
    pub vector_entries: usize,
    pub lexical_entries: u64,
    pub reranker_configured: bool,
}
