//! Query-improvement hints returned with empty responses.

use crate::models::{Query, SearchOptions, SearchType};
use crate::search::text;

const LONG_QUERY_WORDS: usize = 8;

/// Suggestions for a search that produced no results. Never empty.
pub fn empty_result_suggestions(
    query: &Query,
    search_type: SearchType,
    options: &SearchOptions,
) -> Vec<String> {
    let mut out = Vec::new();
    let words = text::tokenize(query.text());

    if words.len() > LONG_QUERY_WORDS {
        let keywords = text::keywords(query.text(), 3);
        if !keywords.is_empty() {
            let short: Vec<&str> = keywords.iter().take(4).map(String::as_str).collect();
            out.push(format!("Try a shorter query, e.g. \"{}\"", short.join(" ")));
        } else {
            out.push("Try a shorter, more specific query".to_string());
        }
    }

    out.push("Check the spelling of key terms".to_string());
    out.push("Try different wording or synonyms".to_string());

    if !options.expand_query {
        out.push("Enable query expansion to search related terms".to_string());
    }
    if !query.facets.is_empty() {
        out.push("Remove or relax facet filters".to_string());
    }
    if query.document_ids.is_some() {
        out.push("Search across all documents instead of a selection".to_string());
    }
    if options.confidence_threshold > 0.0 {
        out.push(format!(
            "Lower the confidence threshold (currently {:.2})",
            options.confidence_threshold
        ));
    }
    if search_type == SearchType::Vector {
        out.push("Use hybrid search to include keyword matches".to_string());
    }
    out
}
