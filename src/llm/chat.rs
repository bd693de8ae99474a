//! Single-turn, non-streaming chat completion against the configured provider.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

/// One chat message. Both providers use the same `{role, content}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Message,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: Message,
}

/// Send `prompt` as a single user message and return the reply text.
///
/// `purpose` only shows up in error context.
pub async fn complete(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
    temperature: f32,
    purpose: &str,
) -> Result<String> {
    let (url, req) = match config.provider.as_str() {
        "ollama" => (
            format!("{}/api/chat", config.base_url),
            ChatRequest {
                model: &config.chat_model,
                messages: vec![Message::user(prompt)],
                stream: Some(false),
                temperature: None,
            },
        ),
        "openai" => (
            format!("{}/v1/chat/completions", config.base_url),
            ChatRequest {
                model: &config.chat_model,
                messages: vec![Message::user(prompt)],
                stream: None,
                temperature: Some(temperature),
            },
        ),
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    };

    let mut builder = client.post(&url).json(&req);
    if let Some(key) = &config.api_key {
        builder = builder.header("Authorization", format!("Bearer {key}"));
    }
    let resp = builder
        .send()
        .await
        .with_context(|| format!("Failed to call {} chat API for {purpose}", config.provider))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} chat API returned {status}: {body}", config.provider);
    }

    let body = resp.text().await.context("Failed to read chat response")?;
    parse_reply(&config.provider, &body)
}

fn parse_reply(provider: &str, body: &str) -> Result<String> {
    if provider == "ollama" {
        let parsed: OllamaChatResponse =
            serde_json::from_str(body).context("Unexpected Ollama chat response")?;
        return Ok(parsed.message.content);
    }
    let parsed: OpenAiChatResponse =
        serde_json::from_str(body).context("Unexpected OpenAI chat response")?;
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .unwrap_or_default())
}
