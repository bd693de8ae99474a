use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

/// Turns texts into embedding vectors, one per input, in order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedder backed by an Ollama or OpenAI-compatible HTTP API.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings = embed_batch(&self.client, &self.config, texts).await?;
        if embeddings.len() != texts.len() {
            anyhow::bail!(
                "Embedding API returned {} vectors for {} inputs",
                embeddings.len(),
                texts.len()
            );
        }
        check_dimensions(&embeddings, self.config.embedding_dim)?;
        Ok(embeddings)
    }
}

/// Every vector must have the configured dimension (`LLM_EMBEDDING_DIM`).
fn check_dimensions(embeddings: &[Vec<f32>], expected: usize) -> Result<()> {
    if let Some(bad) = embeddings.iter().find(|e| e.len() != expected) {
        anyhow::bail!(
            "Embedding model returned {} dimensions, expected {expected}; check LLM_EMBEDDING_DIM",
            bad.len()
        );
    }
    Ok(())
}

/// Maximum characters to send per text to the embedding API.
/// nomic-embed-text has an 8 192-token context. Extracted document text
/// (tables, numeric runs) can tokenise densely, so stay well under it.
/// `truncate: true` is also sent to Ollama, but it can still return 400 for
/// inputs that exceed the context length.
const MAX_EMBED_CHARS: usize = 3_000;

/// Truncate `text` to at most `MAX_EMBED_CHARS`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    // Find the last char boundary at or before the limit
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Generate embeddings for a batch of texts using the configured LLM provider.
pub async fn embed_batch(
    client: &reqwest::Client,
    config: &LlmConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let truncated: Vec<String> = texts
        .iter()
        .map(|t| truncate_for_embedding(t).to_string())
        .collect();

    embed_batched(client, config, &truncated).await
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    /// Ollama only: truncate over-long inputs instead of returning 400.
    #[serde(skip_serializing_if = "Option::is_none")]
    truncate: Option<bool>,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

/// Endpoint path and batch size per provider.
fn provider_route(provider: &str) -> Result<(&'static str, usize)> {
    match provider {
        "ollama" => Ok(("/api/embed", 32)),
        "openai" => Ok(("/v1/embeddings", 64)),
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    }
}

fn parse_embeddings(provider: &str, body: &str) -> Result<Vec<Vec<f32>>> {
    if provider == "ollama" {
        let parsed: OllamaEmbedResponse =
            serde_json::from_str(body).context("Failed to parse Ollama embed response")?;
        return Ok(parsed.embeddings);
    }
    let parsed: OpenAiEmbedResponse =
        serde_json::from_str(body).context("Failed to parse OpenAI embed response")?;
    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}

async fn embed_batched(
    client: &reqwest::Client,
    config: &LlmConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let provider = config.provider.as_str();
    let (path, batch_size) = provider_route(provider)?;
    let url = format!("{}{path}", config.base_url);

    let mut all_embeddings = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let req = EmbedRequest {
            model: &config.embedding_model,
            input: batch,
            truncate: (provider == "ollama").then_some(true),
        };

        let mut builder = client.post(&url).json(&req);
        if let Some(key) = &config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to call {provider} embed API"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{provider} embed API returned {status}: {body}");
        }

        let body = resp.text().await.context("Failed to read embed response")?;
        all_embeddings.extend(parse_embeddings(provider, &body)?);
    }

    Ok(all_embeddings)
}
