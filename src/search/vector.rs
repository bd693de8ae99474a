use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::SearchError;
use crate::llm::embeddings::Embedder;
use crate::models::{Candidate, ChunkRecord, OwnerScope};
use crate::search::{RetrievalOptions, RetrievalOutput, VectorSearch};

/// A stored vector entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorEntry {
    chunk: ChunkRecord,
    embedding: Vec<f32>,
}

/// In-memory vector store with optional disk persistence and cosine similarity search.
pub struct VectorStore {
    entries: RwLock<Vec<VectorEntry>>,
    persist_path: Option<PathBuf>,
}

impl VectorStore {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            persist_path: None,
        }
    }

    pub fn open_or_create(vector_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(vector_dir)?;
        let persist_path = vector_dir.join("vectors.json");

        let entries = if persist_path.exists() {
            let data = std::fs::read_to_string(&persist_path)
                .context("Failed to read vector store")?;
            serde_json::from_str(&data).context("Failed to parse vector store")?
        } else {
            Vec::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            persist_path: Some(persist_path),
        })
    }

    /// Add vectors for chunks. `embeddings` must be parallel with `chunks`.
    /// Re-adding a chunk id replaces the previous entry.
    pub fn add_chunks(&self, chunks: &[ChunkRecord], embeddings: Vec<Vec<f32>>) -> Result<()> {
        if chunks.len() != embeddings.len() {
            anyhow::bail!(
                "Got {} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            );
        }

        let mut entries = self.entries.write();
        let incoming: std::collections::HashSet<Uuid> = chunks.iter().map(|c| c.chunk_id).collect();

        // All vectors in the store must share one dimension
        let expected = entries
            .iter()
            .find(|e| !incoming.contains(&e.chunk.chunk_id))
            .map(|e| e.embedding.len())
            .or_else(|| embeddings.first().map(Vec::len));
        if let Some(dim) = expected {
            if let Some(bad) = embeddings.iter().find(|e| e.len() != dim || e.is_empty()) {
                anyhow::bail!(
                    "Embedding has {} dimensions, the store holds {dim}-dimensional vectors",
                    bad.len()
                );
            }
        }

        entries.retain(|e| !incoming.contains(&e.chunk.chunk_id));

        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            entries.push(VectorEntry {
                chunk: chunk.clone(),
                embedding,
            });
        }

        self.persist(&entries)
    }

    /// Delete all vectors for a document. Returns how many were removed.
    pub fn delete_document(&self, document_id: &Uuid) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| &e.chunk.document_id != document_id);
        let removed = before - entries.len();
        self.persist(&entries)?;
        Ok(removed)
    }

    fn persist(&self, entries: &[VectorEntry]) -> Result<()> {
        if let Some(path) = &self.persist_path {
            let data = serde_json::to_string(entries)?;
            std::fs::write(path, data).context("Failed to persist vector store")?;
        }
        Ok(())
    }

    /// Search by cosine similarity against a query embedding.
    ///
    /// Returns up to `options.limit` candidates with similarity >= `options.threshold`,
    /// best first, and the number of matches before truncation.
    pub fn search(
        &self,
        query_embedding: &[f32],
        owner: &OwnerScope,
        options: &RetrievalOptions,
    ) -> (Vec<Candidate>, usize) {
        let entries = self.entries.read();

        let mut scored: Vec<(f32, &VectorEntry)> = entries
            .iter()
            .filter(|e| options.admits(owner, &e.chunk))
            .map(|e| {
                let sim = cosine_similarity(query_embedding, &e.embedding).min(1.0);
                (sim, e)
            })
            .filter(|(score, _)| *score >= options.threshold)
            .collect();

        // Sort descending by score
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let total = scored.len();
        scored.truncate(options.limit);

        let hits = scored
            .into_iter()
            .map(|(score, e)| Candidate::from_vector(&e.chunk, score))
            .collect();
        (hits, total)
    }

    /// Dimension of the stored vectors, `None` while the store is empty.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.read().first().map(|e| e.embedding.len())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Get counts grouped by document id.
    pub fn document_counts(&self) -> HashMap<Uuid, usize> {
        let entries = self.entries.read();
        let mut counts = HashMap::new();
        for e in entries.iter() {
            *counts.entry(e.chunk.document_id).or_insert(0) += 1;
        }
        counts
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Vector search over a [`VectorStore`], embedding queries with an [`Embedder`].
#[derive(Clone)]
pub struct VectorIndex {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndex {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Embed and store chunks.
    pub async fn index_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed(&texts)
            .await
            .context("Failed to embed chunks")?;
        self.store.add_chunks(chunks, embeddings)
    }
}

#[async_trait]
impl VectorSearch for VectorIndex {
    async fn search(
        &self,
        query: &str,
        owner: &OwnerScope,
        options: &RetrievalOptions,
    ) -> crate::error::Result<RetrievalOutput> {
        let start = Instant::now();
        let embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| SearchError::unavailable("embedding", e))?
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SearchError::unavailable("embedding", "no embedding returned"))?;
        if let Some(dim) = self.store.dimension() {
            if embedding.len() != dim {
                return Err(SearchError::unavailable(
                    "embedding",
                    format!(
                        "query embedding has {} dimensions, indexed vectors have {dim}",
                        embedding.len()
                    ),
                ));
            }
        }

        let (results, total_results) = self.store.search(&embedding, owner, options);
        Ok(RetrievalOutput {
            results,
            total_results,
            search_time_ms: start.elapsed().as_millis() as u64,
            cache_hit: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(owner: &str, doc: Uuid, content: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: Uuid::new_v4(),
            document_id: doc,
            owner_id: owner.to_string(),
            content: content.to_string(),
            page_number: None,
            element_type: None,
            bbox: None,
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("connection refused")
        }
    }

    /// Returns a fixed-size zero-padded vector for every input.
    struct FixedDimEmbedder(usize);

    #[async_trait]
    impl Embedder for FixedDimEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|_| {
                    let mut v = vec![0.0; self.0];
                    v[0] = 1.0;
                    v
                })
                .collect())
        }
    }

    #[test]
    fn test_cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_search_applies_threshold_limit_and_owner() {
        let store = VectorStore::in_memory();
        let doc = Uuid::new_v4();
        let chunks = vec![
            chunk("alice", doc, "a"),
            chunk("alice", doc, "b"),
            chunk("alice", doc, "c"),
            chunk("bob", doc, "d"),
        ];
        let embeddings = vec![
            vec![1.0, 0.0],
            vec![0.8, 0.6],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ];
        store.add_chunks(&chunks, embeddings).unwrap();

        let owner = OwnerScope::new("alice");
        let opts = RetrievalOptions {
            limit: 1,
            threshold: 0.5,
            ..Default::default()
        };
        let (hits, total) = store.search(&[1.0, 0.0], &owner, &opts);
        assert_eq!(total, 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "a");
        assert_eq!(hits[0].vector_score, Some(hits[0].fused_score));
    }

    #[test]
    fn test_readd_replaces_and_delete_document() {
        let store = VectorStore::in_memory();
        let doc = Uuid::new_v4();
        let c = chunk("alice", doc, "a");
        store.add_chunks(&[c.clone()], vec![vec![1.0]]).unwrap();
        store.add_chunks(&[c], vec![vec![0.5]]).unwrap();
        assert_eq!(store.entry_count(), 1);
        assert_eq!(store.document_counts().get(&doc), Some(&1));
        assert_eq!(store.delete_document(&doc).unwrap(), 1);
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_add_rejects_mismatched_lengths() {
        let store = VectorStore::in_memory();
        let c = chunk("alice", Uuid::new_v4(), "a");
        assert!(store.add_chunks(&[c], vec![]).is_err());
    }

    #[test]
    fn test_add_rejects_dimension_change() {
        let store = VectorStore::in_memory();
        let doc = Uuid::new_v4();
        let first = chunk("alice", doc, "a");
        store.add_chunks(&[first.clone()], vec![vec![1.0, 0.0]]).unwrap();

        assert!(store
            .add_chunks(&[chunk("alice", doc, "b")], vec![vec![1.0, 0.0, 0.0]])
            .is_err());
        assert!(store
            .add_chunks(
                &[chunk("alice", doc, "c"), chunk("alice", doc, "d")],
                vec![vec![1.0, 0.0], vec![1.0]],
            )
            .is_err());
        assert_eq!(store.entry_count(), 1);

        // Replacing the only entry may change the dimension
        store.add_chunks(&[first], vec![vec![1.0, 0.0, 0.0]]).unwrap();
        assert_eq!(store.dimension(), Some(3));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch_is_service_unavailable() {
        let store = Arc::new(VectorStore::in_memory());
        store
            .add_chunks(&[chunk("alice", Uuid::new_v4(), "a")], vec![vec![1.0, 0.0]])
            .unwrap();
        let index = VectorIndex::new(store, Arc::new(FixedDimEmbedder(3)));
        let opts = RetrievalOptions {
            threshold: 0.0,
            ..Default::default()
        };
        let err = index
            .search("q", &OwnerScope::new("alice"), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");

        let matching = VectorIndex::new(index.store.clone(), Arc::new(FixedDimEmbedder(2)));
        let out = matching
            .search("q", &OwnerScope::new("alice"), &opts)
            .await
            .unwrap();
        assert_eq!(out.results.len(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_service_unavailable() {
        let index = VectorIndex::new(Arc::new(VectorStore::in_memory()), Arc::new(FailingEmbedder));
        let err = index
            .search("q", &OwnerScope::new("alice"), &RetrievalOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = VectorStore::open_or_create(dir.path()).unwrap();
            store
                .add_chunks(&[chunk("alice", doc, "persisted")], vec![vec![0.3, 0.4]])
                .unwrap();
        }
        let store = VectorStore::open_or_create(dir.path()).unwrap();
        assert_eq!(store.entry_count(), 1);
    }
}
