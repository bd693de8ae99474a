//! Bookkeeping for multi-step search: candidate accumulation across rounds,
//! sub-query refinement and the stop rule.
//!
//! The rounds themselves are driven by [`SearchEngine`](crate::search::pipeline::SearchEngine),
//! which owns the retrieval backends.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::models::Candidate;
use crate::search::text;

/// How many of a round's best results feed the next round's sub-queries.
const REFINE_FROM_TOP: usize = 3;
/// Novel terms appended to the original keywords per sub-query.
const TERMS_PER_SUBQUERY: usize = 3;
const MAX_SUBQUERIES: usize = 2;
const MIN_TERM_CHARS: usize = 4;

/// Candidates collected across rounds, de-duplicated by chunk id.
#[derive(Debug, Default)]
pub struct Accumulator {
    index: HashMap<Uuid, usize>,
    items: Vec<Candidate>,
}

impl Accumulator {
    /// Add one round's hits. Returns how many chunk ids were new.
    ///
    /// A chunk seen again keeps its best scores and its first position.
    pub fn absorb(&mut self, hits: Vec<Candidate>) -> usize {
        let mut added = 0;
        for hit in hits {
            match self.index.get(&hit.chunk_id) {
                Some(&i) => {
                    let entry = &mut self.items[i];
                    if hit.fused_score > entry.fused_score {
                        entry.fused_score = hit.fused_score;
                        entry.vector_score = hit.vector_score.or(entry.vector_score);
                        entry.text_score = hit.text_score.or(entry.text_score);
                    }
                }
                None => {
                    self.index.insert(hit.chunk_id, self.items.len());
                    self.items.push(hit);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_candidates(self) -> Vec<Candidate> {
        self.items
    }
}

/// Why the round loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ran `max_steps` rounds.
    StepLimit,
    /// The last round found nothing that was not already accumulated.
    NoNewCandidates,
    /// The round met `min_results_per_step` and the accumulated set is large enough.
    Enough,
    /// No sub-queries could be derived from the last round.
    NoRefinement,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::StepLimit => "step_limit",
            StopReason::NoNewCandidates => "no_new_candidates",
            StopReason::Enough => "enough_results",
            StopReason::NoRefinement => "no_refinement",
        }
    }
}

/// Inputs to the stop decision after a completed round.
#[derive(Debug, Clone, Copy)]
pub struct RoundSummary {
    /// 1-based round number.
    pub step: usize,
    pub round_results: usize,
    pub new_candidates: usize,
    pub accumulated: usize,
}

/// Decide whether to stop after a round. Refinement failure is checked by
/// the caller once it has tried to build the next round's queries.
pub fn stop_after(
    round: &RoundSummary,
    max_steps: usize,
    min_results_per_step: usize,
) -> Option<StopReason> {
    if round.new_candidates == 0 {
        return Some(StopReason::NoNewCandidates);
    }
    if round.round_results >= min_results_per_step
        && round.accumulated >= max_steps * min_results_per_step
    {
        return Some(StopReason::Enough);
    }
    if round.step >= max_steps {
        return Some(StopReason::StepLimit);
    }
    None
}

/// Condense a round's best results into sub-queries for the next round.
///
/// Each sub-query is the original query's keywords plus the most frequent
/// terms of one top result that the query did not already contain.
/// Sub-queries already present in `asked` (normalized) are skipped; new ones
/// are added to it.
pub fn refine_queries(
    original: &str,
    round_top: &[Candidate],
    asked: &mut HashSet<String>,
) -> Vec<String> {
    let base = text::keywords(original, 3);
    let base_set: HashSet<&str> = base.iter().map(String::as_str).collect();
    let mut out = Vec::new();

    for c in round_top.iter().take(REFINE_FROM_TOP) {
        let novel = top_terms(&c.content, &base_set, TERMS_PER_SUBQUERY);
        if novel.is_empty() {
            continue;
        }
        let sub_query = base.iter().chain(novel.iter()).cloned().collect::<Vec<_>>().join(" ");
        if asked.insert(normalize(&sub_query)) {
            out.push(sub_query);
        }
        if out.len() == MAX_SUBQUERIES {
            break;
        }
    }
    out
}

/// Most frequent keywords of `content` not in `exclude`, ties by first occurrence.
fn top_terms(content: &str, exclude: &HashSet<&str>, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, word) in text::tokenize(content).into_iter().enumerate() {
        if word.chars().count() < MIN_TERM_CHARS
            || text::is_stopword(&word)
            || exclude.contains(word.as_str())
            || word.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        counts.entry(word).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(n).map(|(w, _)| w).collect()
}

pub fn normalize(query: &str) -> String {
    text::tokenize(query).join(" ")
}
