use std::sync::Arc;

use crate::config::Config;
use crate::llm::cross_encoder::CrossEncoderReranker;
use crate::llm::embeddings::{Embedder, HttpEmbedder};
use crate::llm::query_expand::LlmExpander;
use crate::search::bm25::Bm25Index;
use crate::search::cache::{MemoryResultCache, ResultCache};
use crate::search::catalog::DocumentCatalog;
use crate::search::metrics::TracingMetricsSink;
use crate::search::pipeline::SearchEngine;
use crate::search::vector::{VectorIndex, VectorStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<SearchEngine>,
    pub bm25: Arc<Bm25Index>,
    pub vectors: Arc<VectorIndex>,
    pub catalog: Arc<DocumentCatalog>,
    pub cache: Option<Arc<dyn ResultCache>>,
    pub reranker_configured: bool,
    /// Bounds concurrent indexing requests (each one embeds a whole document).
    pub index_semaphore: Arc<tokio::sync::Semaphore>,
}

impl AppState {
    /// Open the on-disk stores under `config.data_dir` and wire the HTTP
    /// collaborators from configuration.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        let embedder: Arc<dyn Embedder> =
            Arc::new(HttpEmbedder::new(http_client.clone(), config.llm.clone()));
        Self::with_embedder(config, http_client, embedder)
    }

    /// Same as [`AppState::new`] with a caller-supplied embedder.
    pub fn with_embedder(
        config: Config,
        http_client: reqwest::Client,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Self> {
        // Ensure data directories exist
        std::fs::create_dir_all(&config.data_dir)?;

        let bm25 = Arc::new(Bm25Index::open_or_create(&config.index_dir())?);
        let store = Arc::new(VectorStore::open_or_create(&config.vector_dir())?);
        let vectors = Arc::new(VectorIndex::new(store, embedder));
        let catalog = Arc::new(DocumentCatalog::open_or_create(&config.catalog_path())?);

        let cache: Option<Arc<dyn ResultCache>> = config.cache.enabled.then(|| {
            Arc::new(MemoryResultCache::new(
                config.cache.max_entries,
                config.cache.ttl(),
            )) as Arc<dyn ResultCache>
        });

        let mut builder = SearchEngine::builder(vectors.clone())
            .lexical(bm25.clone())
            .metadata(catalog.clone())
            .metrics(Arc::new(TracingMetricsSink))
            .scoring(config.scoring.clone())
            .fallback_threshold(config.fallback_threshold);

        let reranker = CrossEncoderReranker::from_config(http_client.clone(), &config.reranker);
        let reranker_configured = reranker.is_some();
        if let Some(reranker) = reranker {
            builder = builder.reranker(Arc::new(reranker));
        }
        if config.llm_expansion {
            builder = builder.expander(Arc::new(LlmExpander::new(
                http_client,
                config.llm.clone(),
            )));
        }
        if let Some(cache) = &cache {
            builder = builder.cache(cache.clone());
        }

        Ok(Self {
            config,
            engine: Arc::new(builder.build()),
            bm25,
            vectors,
            catalog,
            cache,
            reranker_configured,
            index_semaphore: Arc::new(tokio::sync::Semaphore::new(2)),
        })
    }

    /// Cached responses are stale once the corpus changes.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}
