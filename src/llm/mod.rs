//! HTTP clients for the model-serving side: embeddings, cross-encoder
//! reranking and LLM query expansion.

pub mod chat;
pub mod cross_encoder;
pub mod embeddings;
pub mod query_expand;
