//! Small text helpers shared by expansion, scoring and multi-step refinement.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "how",
    "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our",
    "should", "so", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "was", "we", "were", "what", "when", "where", "which", "who", "why", "will",
    "with", "would", "you", "your",
];

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Lowercased alphanumeric words, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Distinct non-stopword terms of at least `min_len` chars, in first-seen order.
pub fn keywords(text: &str, min_len: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|w| w.chars().count() >= min_len && !is_stopword(w))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Fraction of `terms` that occur as words in `content`. Empty `terms` gives 0.
pub fn overlap_ratio(terms: &[String], content: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let words: HashSet<String> = tokenize(content).into_iter().collect();
    let hits = terms.iter().filter(|t| words.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}
