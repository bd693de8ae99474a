//! LLM-backed query expansion, degrading to keyword heuristics.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::llm::chat;
use crate::search::expansion::{self, QueryExpander, MAX_VARIANTS};

/// Asks the chat model for alternative phrasings of the query.
#[derive(Clone)]
pub struct LlmExpander {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmExpander {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl QueryExpander for LlmExpander {
    async fn expand(&self, query: &str) -> Vec<String> {
        match expand_query(&self.client, &self.config, query).await {
            Ok(variants) if !variants.is_empty() => expansion::merge_variants(query, variants),
            Ok(_) => expansion::expand_heuristic(query),
            Err(e) => {
                tracing::warn!("LLM query expansion failed, using keyword expansion: {e:#}");
                expansion::expand_heuristic(query)
            }
        }
    }
}

/// Expand a user query into alternative phrasings using the LLM.
pub async fn expand_query(
    client: &reqwest::Client,
    config: &LlmConfig,
    original_query: &str,
) -> Result<Vec<String>> {
    let prompt = format!(
        "You rewrite search queries over a collection of uploaded documents. Given a query, \
         generate exactly {MAX_VARIANTS} alternative phrasings that use different wording or \
         synonyms for the same information need.\n\n\
         Original query: \"{original_query}\"\n\n\
         Respond with ONLY a JSON array of {MAX_VARIANTS} strings. No explanation.\n\
         Example: [\"alternative phrasing 1\", \"alternative phrasing 2\"]"
    );

    let response = chat::complete(client, config, &prompt, 0.3, "query expansion").await?;

    Ok(parse_expanded_queries(&response))
}

fn parse_expanded_queries(content: &str) -> Vec<String> {
    // Extract JSON array from response
    let json_str = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    };

    match serde_json::from_str::<Vec<String>>(json_str) {
        Ok(queries) => queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(MAX_VARIANTS)
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to parse expanded queries: {e}. Raw: {content}");
            Vec::new()
        }
    }
}
