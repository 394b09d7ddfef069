//! Brute-force cosine ranking over a partition's candidates.

use std::cmp::Ordering;

use serde::Serialize;

use crate::chunk::CandidateEntry;

/// A candidate that cleared the similarity floor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub id: String,
    pub similarity: f32,
}

/// Output of [`score`]: the ranked winners plus how many cleared the floor.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub winners: Vec<ScoredCandidate>,
    pub kept: usize,
}

/// Cosine similarity of `a` and `b` over their common prefix.
///
/// Returns `0.0` when either vector has zero magnitude instead of dividing by
/// zero. The result is clamped to `[-1, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0) as f32
}

/// Ranks `candidates` against `query`.
///
/// Candidates below `floor` are dropped; the rest are sorted by descending
/// similarity with ties broken by ascending id, then truncated to `k`
/// (clamped to `[1, max_k]`).
pub fn score(
    query: &[f32],
    candidates: &[CandidateEntry],
    floor: f32,
    k: usize,
    max_k: usize,
) -> Ranking {
    let mut winners: Vec<ScoredCandidate> = candidates
        .iter()
        .filter_map(|candidate| {
            let similarity = cosine_similarity(query, &candidate.embedding);
            (similarity >= floor).then(|| ScoredCandidate {
                id: candidate.id.clone(),
                similarity,
            })
        })
        .collect();
    let kept = winners.len();
    winners.sort_by(rank_order);
    winners.truncate(k.clamp(1, max_k.max(1)));
    Ranking { winners, kept }
}

fn rank_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, embedding: Vec<f32>) -> CandidateEntry {
        CandidateEntry {
            id: id.into(),
            embedding,
        }
    }

    /// Unit vector whose cosine with `[1, 0]` is `similarity`.
    fn at(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).sqrt()]
    }

    fn ids(ranking: &Ranking) -> Vec<&str> {
        ranking.winners.iter().map(|w| w.id.as_str()).collect()
    }

    #[test]
    fn zero_magnitude_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[]), 0.0);
    }

    #[test]
    fn parallel_and_opposite_vectors() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-3.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn ties_break_by_id_and_floor_excludes() {
        let candidates = vec![
            entry("b", at(0.91)),
            entry("c", at(0.55)),
            entry("a", at(0.91)),
        ];
        let ranking = score(&[1.0, 0.0], &candidates, 0.60, 5, 20);
        assert_eq!(ids(&ranking), vec!["a", "b"]);
        assert_eq!(ranking.kept, 2);
    }

    #[test]
    fn truncates_to_clamped_k() {
        let candidates: Vec<_> = (0..30)
            .map(|i| entry(&format!("c{i:02}"), at(0.99 - i as f32 * 0.01)))
            .collect();
        let ranking = score(&[1.0, 0.0], &candidates, 0.0, 100, 20);
        assert_eq!(ranking.winners.len(), 20);
        assert_eq!(ranking.kept, 30);
        assert_eq!(ranking.winners[0].id, "c00");

        let ranking = score(&[1.0, 0.0], &candidates, 0.0, 0, 20);
        assert_eq!(ids(&ranking), vec!["c00"]);
    }

    #[test]
    fn empty_candidates_rank_nothing() {
        let ranking = score(&[1.0, 0.0], &[], 0.6, 5, 20);
        assert!(ranking.winners.is_empty());
        assert_eq!(ranking.kept, 0);
    }

    #[test]
    fn output_is_ordered_and_above_floor() {
        let candidates: Vec<_> = [0.2f32, 0.95, 0.61, 0.6, 0.95, 0.75, -0.4, 0.88]
            .iter()
            .enumerate()
            .map(|(i, &s)| entry(&format!("id{}", 7 - i), at(s)))
            .collect();
        let floor = 0.6;
        let ranking = score(&[1.0, 0.0], &candidates, floor, 20, 20);
        for pair in ranking.winners.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
            if pair[0].similarity == pair[1].similarity {
                assert!(pair[0].id < pair[1].id);
            }
        }
        assert!(ranking.winners.iter().all(|w| w.similarity >= floor));
    }
}
