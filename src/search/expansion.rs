//! Query expansion: derive extra search strings from the raw query to improve recall.
//!
//! Expansion never fails. Every expander returns the original query first,
//! followed by at most [`MAX_VARIANTS`] distinct variants.

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;

use crate::search::text;

/// Upper bound on auxiliary variants (the original query is not counted).
pub const MAX_VARIANTS: usize = 2;
const MAX_SYNONYMS: usize = 5;

#[async_trait]
pub trait QueryExpander: Send + Sync {
    /// Original query first, then auxiliary variants.
    async fn expand(&self, query: &str) -> Vec<String>;
}

/// Keyword-extraction + synonym expansion, no external calls.
#[derive(Debug, Clone, Default)]
pub struct HeuristicExpander;

#[async_trait]
impl QueryExpander for HeuristicExpander {
    async fn expand(&self, query: &str) -> Vec<String> {
        expand_heuristic(query)
    }
}

/// Document-domain synonym map for common question vocabulary.
fn synonym_map() -> HashMap<&'static str, &'static [&'static str]> {
    let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    m.insert("install", &["setup", "installation", "configure"]);
    m.insert("installation", &["setup", "install", "configuration"]);
    m.insert("setup", &["installation", "configuration"]);
    m.insert("steps", &["procedure", "instructions", "guide"]);
    m.insert("error", &["issue", "problem", "failure"]);
    m.insert("fix", &["resolve", "troubleshoot", "solution"]);
    m.insert("price", &["cost", "pricing", "fee"]);
    m.insert("cost", &["price", "pricing", "expense"]);
    m.insert("requirements", &["prerequisites", "dependencies"]);
    m.insert("summary", &["overview", "abstract", "conclusion"]);
    m.insert("results", &["findings", "outcomes"]);
    m.insert("method", &["approach", "methodology", "technique"]);
    m.insert("revenue", &["income", "sales", "earnings"]);
    m.insert("policy", &["rules", "guidelines", "terms"]);
    m.insert("contract", &["agreement", "terms"]);
    m.insert("deadline", &["due", "date", "schedule"]);
    m.insert("warranty", &["guarantee", "coverage"]);
    m
}

/// Append related terms for each query word that has synonyms.
pub fn synonym_variant(query: &str) -> Option<String> {
    let map = synonym_map();
    let words = text::tokenize(query);
    let mut expansions: Vec<&str> = Vec::new();

    for word in &words {
        if let Some(synonyms) = map.get(word.as_str()) {
            for syn in *synonyms {
                if !words.iter().any(|w| w == syn) && !expansions.contains(syn) {
                    expansions.push(syn);
                }
            }
        }
    }

    if expansions.is_empty() {
        return None;
    }
    expansions.truncate(MAX_SYNONYMS);
    Some(format!("{} {}", query, expansions.join(" ")))
}

/// Keywords of the query with stopwords and very short words removed.
pub fn keyword_variant(query: &str) -> Option<String> {
    let keywords = text::keywords(query, 3);
    if keywords.is_empty() {
        return None;
    }
    Some(keywords.join(" "))
}

pub fn expand_heuristic(query: &str) -> Vec<String> {
    let candidates = [keyword_variant(query), synonym_variant(query)];
    merge_variants(query, candidates.into_iter().flatten())
}

/// Original first, then distinct variants (case-insensitive, whitespace-normalized).
pub fn merge_variants(query: &str, variants: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    seen.insert(normalize(query));
    out.push(query.to_string());

    for v in variants {
        if out.len() > MAX_VARIANTS {
            break;
        }
        let v = v.trim().to_string();
        if v.is_empty() {
            continue;
        }
        if seen.insert(normalize(&v)) {
            out.push(v);
        }
    }
    out
}

fn normalize(s: &str) -> String {
    text::tokenize(s).join(" ")
}
