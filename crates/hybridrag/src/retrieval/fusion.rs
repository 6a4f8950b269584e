//! Reciprocal Rank Fusion over ranked candidate lists

use std::collections::HashMap;

/// Scale factor applied to raw RRF scores before the shared `min_score`
/// cutoff. RRF sums of 1/(k+rank) terms are small (two first-place ranks at
/// k=60 sum to ~0.033); multiplying by 30 maps strong agreement near 1.0 so
/// the same threshold works for fused and single-source searches.
pub const RRF_SCALE: f32 = 30.0;

/// Fuse ranked lists of candidate ids.
///
/// For each candidate appearing in at least one list at 1-based position
/// `rank_i`, the fused score is `Σ 1/(k + rank_i)`. Returns candidates with
/// raw fused scores, unordered; the caller sorts with its tie-break rule.
pub fn rrf_fuse(lists: &[Vec<String>], k: u32) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for list in lists {
        for (i, id) in list.iter().enumerate() {
            let rank = i as f32 + 1.0;
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f32 + rank);
        }
    }
    scores
}

/// Scale a raw RRF score into [0, 1] for the shared cutoff
pub fn normalize_rrf(score: f32) -> f32 {
    (score * RRF_SCALE).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn candidate_in_both_lists_beats_single_list() {
        let vector = ids(&["a", "b", "c"]);
        let keyword = ids(&["a", "d"]);
        let fused = rrf_fuse(&[vector, keyword], 60);

        assert!(fused["a"] > fused["b"]);
        assert!(fused["a"] > fused["d"]);
    }

    #[test]
    fn rrf_is_monotone_in_rank() {
        // A ranked above B in every list must never score below B.
        let list1 = ids(&["a", "b"]);
        let list2 = ids(&["x", "a", "b"]);
        let fused = rrf_fuse(&[list1, list2], 60);
        assert!(fused["a"] >= fused["b"]);
    }

    #[test]
    fn k_constant_dampens_rank_gaps() {
        let list = ids(&["a", "b"]);
        let tight = rrf_fuse(std::slice::from_ref(&list), 60);
        let loose = rrf_fuse(std::slice::from_ref(&list), 1);

        let tight_gap = tight["a"] - tight["b"];
        let loose_gap = loose["a"] - loose["b"];
        assert!(loose_gap > tight_gap);
    }

    #[test]
    fn normalization_clips_to_unit_interval() {
        assert_eq!(normalize_rrf(10.0), 1.0);
        assert_eq!(normalize_rrf(0.0), 0.0);
        let first_both = 2.0 / 61.0;
        let n = normalize_rrf(first_both);
        assert!(n > 0.9 && n <= 1.0);
    }

    #[test]
    fn empty_lists_fuse_to_nothing() {
        assert!(rrf_fuse(&[], 60).is_empty());
        assert!(rrf_fuse(&[Vec::new()], 60).is_empty());
    }
}
