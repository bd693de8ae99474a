//! # rag-retrieval
//!
//! Retrieval service for a document question-answering system. Documents
//! arrive as pre-extracted chunks, are indexed into a vector store and a
//! BM25 index, and are searched with a configurable pipeline.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────────┐
//!                      │ Query + owner scope  │
//!                      └──────────┬───────────┘
//!                                 │ validate, cache lookup
//!                                 ▼
//!                      ┌──────────────────────┐
//!                      │   Query Expansion    │
//!                      │ original + variants  │
//!                      └──────────┬───────────┘
//!                                 │
//!        ┌──────────────┬─────────┴────┬──────────────────┐
//!        ▼              ▼              ▼                  ▼
//!   ┌─────────┐   ┌───────────┐  ┌─────────────┐   ┌─────────────┐
//!   │ Vector  │   │  Hybrid   │  │  Context-   │   │ Multi-step  │
//!   │         │   │ vec+BM25  │  │   aware     │   │  refining   │
//!   └────┬────┘   └─────┬─────┘  └──────┬──────┘   └──────┬──────┘
//!        └──────────────┴───────┬───────┴─────────────────┘
//!                               │ zero hits: one low-threshold retry
//!                               ▼
//!                  ┌────────────────────────┐
//!                  │ Cross-encoder rerank   │
//!                  │ (when configured)      │
//!                  └───────────┬────────────┘
//!                              ▼
//!                  ┌────────────────────────┐
//!                  │ Quality score,         │
//!                  │ confidence cut, facets │
//!                  └───────────┬────────────┘
//!                              ▼
//!                  ┌────────────────────────┐
//!                  │ Results / suggestions  │
//!                  └────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration for server, stores, LLM and reranker
//! - [`error`] - `SearchError`, the pipeline's typed failure kinds
//! - [`models`] - Queries, options, facets, candidates, responses and wire types
//! - [`search::pipeline`] - `SearchEngine`, the end-to-end search orchestration
//! - [`search::bm25`] - BM25 full-text index powered by tantivy
//! - [`search::vector`] - In-memory vector store with cosine similarity and disk persistence
//! - [`search::hybrid`] - Weighted fusion of vector and keyword scores
//! - [`search::multi_step`] - Round accumulation, stop rules and query refinement
//! - [`search::facets`] - Post-retrieval facet filters
//! - [`llm::embeddings`] - Batch embedding generation via Ollama or OpenAI-compatible APIs
//! - [`llm::cross_encoder`] - Cross-encoder reranking client
//! - [`llm::query_expand`] - LLM-powered query variants with a keyword fallback
//! - [`api`] - Axum HTTP handlers for search and document indexing
//! - [`state`] - Shared application state wiring stores and collaborators

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod search;
pub mod state;
