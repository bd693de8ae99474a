//! Cross-encoder reranker via a Cohere-style `/v1/rerank` endpoint.
//!
//! All query-document pairs go out in one batch request. Raw logits are
//! squashed through a sigmoid so scores land in 0-1.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RerankerConfig;
use crate::error::SearchError;
use crate::search::rerank::{RerankScore, Reranker};

/// Hard ceiling on the per-request timeout, whatever the configuration says.
const MAX_TIMEOUT_SECS: u64 = 30;

/// [`Reranker`] backed by a `/v1/rerank` HTTP endpoint.
#[derive(Clone)]
pub struct CrossEncoderReranker {
    client: reqwest::Client,
    config: RerankerConfig,
}

impl CrossEncoderReranker {
    /// Returns `None` when no reranker endpoint is configured.
    pub fn from_config(client: reqwest::Client, config: &RerankerConfig) -> Option<Self> {
        config.base_url.as_ref()?;
        Some(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> crate::error::Result<Vec<RerankScore>> {
        rerank(&self.client, &self.config, query, documents, top_k)
            .await
            .map_err(|e| SearchError::unavailable("reranker", e))
    }
}

/// Rerank documents against a query using a cross-encoder model.
///
/// Returns results sorted by score descending. Returns Err if the
/// reranker endpoint is unreachable or returns an error.
pub async fn rerank(
    client: &reqwest::Client,
    config: &RerankerConfig,
    query: &str,
    documents: &[String],
    top_n: usize,
) -> Result<Vec<RerankScore>> {
    if documents.is_empty() {
        return Ok(Vec::new());
    }

    let base_url = config
        .base_url
        .as_deref()
        .context("Reranker base_url not configured")?;

    let model = config.model.as_deref().unwrap_or("default");

    let url = format!("{}/v1/rerank", base_url.trim_end_matches('/'));

    let req_body = RerankRequest {
        model: model.to_string(),
        query: query.to_string(),
        documents: documents.to_vec(),
        top_n,
    };

    let timeout = std::time::Duration::from_secs(config.timeout_secs.min(MAX_TIMEOUT_SECS));

    let mut req = client.post(&url).timeout(timeout).json(&req_body);
    if let Some(key) = config.api_key.as_deref() {
        req = req.bearer_auth(key);
    }

    let resp = req
        .send()
        .await
        .context("Failed to reach reranker endpoint")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Reranker returned {status}: {body}");
    }

    let body: RerankResponse = resp
        .json()
        .await
        .context("Failed to parse reranker response")?;

    Ok(normalize_results(body.results, top_n))
}

/// Apply the sigmoid, sort best first and cap at `top_n`.
fn normalize_results(raw: Vec<RerankResultRaw>, top_n: usize) -> Vec<RerankScore> {
    let mut results: Vec<RerankScore> = raw
        .into_iter()
        .map(|r| RerankScore {
            index: r.index,
            score: sigmoid(r.relevance_score),
        })
        .collect();

    // Sort by score descending
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(top_n);
    results
}

/// Sigmoid normalization: maps raw logits to 0-1 range.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ─── Request/Response types ────────────────────────────

#[derive(Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Debug, Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_zero() {
        let s = sigmoid(0.0);
        assert!((s - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_large_positive() {
        let s = sigmoid(10.0);
        assert!(s > 0.999);
    }

    #[test]
    fn test_sigmoid_large_negative() {
        let s = sigmoid(-10.0);
        assert!(s < 0.001);
    }

    #[test]
    fn test_sigmoid_known_value() {
        // sigmoid(1) ≈ 0.7310586
        let s = sigmoid(1.0);
        assert!((s - 0.7310586).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_results_sorts_and_caps() {
        let raw = vec![
            RerankResultRaw { index: 0, relevance_score: -2.0 },
            RerankResultRaw { index: 1, relevance_score: 3.0 },
            RerankResultRaw { index: 2, relevance_score: 0.0 },
        ];
        let out = normalize_results(raw, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].index, 1);
        assert_eq!(out[1].index, 2);
        assert!(out.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_parse_response_body() {
        let body = r#"{"results":[
            {"index":1,"relevance_score":1.5},
            {"index":0,"relevance_score":-0.5}
        ]}"#;
        let parsed: RerankResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.len(), 2);
    }

    #[test]
    fn test_from_config_requires_base_url() {
        let client = reqwest::Client::new();
        let unset = RerankerConfig::default();
        assert!(CrossEncoderReranker::from_config(client.clone(), &unset).is_none());
        let config = RerankerConfig {
            base_url: Some("http://127.0.0.1:8082".to_string()),
            ..Default::default()
        };
        assert!(CrossEncoderReranker::from_config(client, &config).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_service_unavailable() {
        let config = RerankerConfig {
            // Reserved port, nothing listens here
            base_url: Some("http://127.0.0.1:1".to_string()),
            timeout_secs: 1,
            ..Default::default()
        };
        let reranker = CrossEncoderReranker::from_config(reqwest::Client::new(), &config).unwrap();
        let err = reranker
            .rerank("q", &["doc".to_string()], 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");
    }

    #[test]
    fn test_sigmoid_symmetry() {
        // sigmoid(x) + sigmoid(-x) = 1
        let x = 2.5f32;
        let sum = sigmoid(x) + sigmoid(-x);
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
