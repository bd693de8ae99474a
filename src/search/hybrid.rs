use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Result, SearchError};
use crate::models::Candidate;

/// Fusion weights. Validated upstream to sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub vector: f32,
    pub text: f32,
}

/// Merge the hit lists of several query variants from one source.
///
/// Duplicates (same chunk id) keep their best score and the position of their
/// first appearance, so the original query's ordering dominates.
pub fn merge_variant_hits(lists: Vec<Vec<Candidate>>) -> Vec<Candidate> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut merged: Vec<Candidate> = Vec::new();

    for list in lists {
        for hit in list {
            match index.get(&hit.chunk_id) {
                Some(&i) => {
                    let entry = &mut merged[i];
                    entry.vector_score = max_opt(entry.vector_score, hit.vector_score);
                    entry.text_score = max_opt(entry.text_score, hit.text_score);
                    entry.fused_score = entry.fused_score.max(hit.fused_score);
                }
                None => {
                    index.insert(hit.chunk_id, merged.len());
                    merged.push(hit);
                }
            }
        }
    }

    merged
}

fn max_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Weighted score fusion of vector and lexical candidates.
///
/// A candidate found by both sources scores `vector * v + text * t`. A
/// candidate found by only one source keeps that source's score, as if the
/// missing side's weight had been given to the present one. Output is sorted
/// by fused score descending; ties keep retrieval order (vector hits first,
/// then lexical-only hits).
pub fn weighted_fusion(
    vector_hits: Vec<Candidate>,
    text_hits: Vec<Candidate>,
    weights: FusionWeights,
) -> Result<Vec<Candidate>> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut fused: Vec<Candidate> = Vec::with_capacity(vector_hits.len() + text_hits.len());

    for mut hit in vector_hits {
        hit.vector_score = hit.vector_score.or(Some(hit.fused_score));
        hit.text_score = None;
        index.insert(hit.chunk_id, fused.len());
        fused.push(hit);
    }

    for hit in text_hits {
        let text_score = hit.text_score.unwrap_or(hit.fused_score);
        match index.get(&hit.chunk_id) {
            Some(&i) => fused[i].text_score = Some(text_score),
            None => {
                let mut hit = hit;
                hit.vector_score = None;
                hit.text_score = Some(text_score);
                index.insert(hit.chunk_id, fused.len());
                fused.push(hit);
            }
        }
    }

    for c in fused.iter_mut() {
        c.fused_score = match (c.vector_score, c.text_score) {
            (Some(v), Some(t)) => weights.vector * v + weights.text * t,
            (Some(v), None) => v,
            (None, Some(t)) => t,
            (None, None) => c.fused_score,
        };
    }

    sort_by_fused(&mut fused)?;
    Ok(fused)
}

/// Stable descending sort on fused score. Non-finite scores are a bug upstream.
pub fn sort_by_fused(candidates: &mut [Candidate]) -> Result<()> {
    if let Some(bad) = candidates.iter().find(|c| !c.fused_score.is_finite()) {
        tracing::error!(
            "Non-finite fused score {} for chunk {}",
            bad.fused_score,
            bad.chunk_id
        );
        return Err(SearchError::internal(format!(
            "non-finite fused score for chunk {}",
            bad.chunk_id
        )));
    }
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: FusionWeights = FusionWeights {
        vector: 0.7,
        text: 0.3,
    };

    fn hit(id: Uuid, content: &str, vector: Option<f32>, text: Option<f32>) -> Candidate {
        Candidate {
            chunk_id: id,
            document_id: Uuid::nil(),
            content: content.to_string(),
            page_number: None,
            element_type: None,
            bbox: None,
            vector_score: vector,
            text_score: text,
            fused_score: vector.or(text).unwrap_or(0.0),
        }
    }

    #[test]
    fn test_empty_inputs() {
        let results = weighted_fusion(vec![], vec![], W).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_both_sources_weighted_sum() {
        let id = Uuid::new_v4();
        let results = weighted_fusion(
            vec![hit(id, "a", Some(0.8), None)],
            vec![hit(id, "a", None, Some(0.5))],
            W,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        let expected = 0.7 * 0.8 + 0.3 * 0.5;
        assert!((results[0].fused_score - expected).abs() < 1e-6);
        assert_eq!(results[0].vector_score, Some(0.8));
        assert_eq!(results[0].text_score, Some(0.5));
    }

    #[test]
    fn test_single_source_keeps_its_score() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let results = weighted_fusion(
            vec![hit(a, "a", Some(0.6), None)],
            vec![hit(b, "b", None, Some(0.9))],
            W,
        )
        .unwrap();
        assert_eq!(results.len(), 2);
        // Lexical-only candidate is not scaled down by the text weight
        assert_eq!(results[0].chunk_id, b);
        assert!((results[0].fused_score - 0.9).abs() < 1e-6);
        assert!((results[1].fused_score - 0.6).abs() < 1e-6);
        assert_eq!(results[0].vector_score, None);
    }

    #[test]
    fn test_ties_keep_retrieval_order() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let results = weighted_fusion(
            vec![hit(ids[0], "a", Some(0.5), None), hit(ids[1], "b", Some(0.5), None)],
            vec![hit(ids[2], "c", None, Some(0.5)), hit(ids[3], "d", None, Some(0.5))],
            W,
        )
        .unwrap();
        let order: Vec<Uuid> = results.iter().map(|c| c.chunk_id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_fused_score_respects_threshold_when_sources_do() {
        // Every source score >= 0.3 means every fused score >= 0.3
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let results = weighted_fusion(
            vec![hit(a, "a", Some(0.3), None), hit(b, "b", Some(0.95), None)],
            vec![hit(a, "a", None, Some(0.31)), hit(b, "b", None, Some(0.3))],
            W,
        )
        .unwrap();
        assert!(results.iter().all(|c| c.fused_score >= 0.3 - 1e-6));
    }

    #[test]
    fn test_nan_score_is_internal_error() {
        let err = weighted_fusion(vec![hit(Uuid::new_v4(), "a", Some(f32::NAN), None)], vec![], W)
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_merge_variant_hits_keeps_max_and_first_position() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_variant_hits(vec![
            vec![hit(a, "a", Some(0.4), None), hit(b, "b", Some(0.9), None)],
            vec![hit(a, "a", Some(0.7), None)],
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].chunk_id, a);
        assert_eq!(merged[0].vector_score, Some(0.7));
        assert_eq!(merged[0].fused_score, 0.7);
    }
}
