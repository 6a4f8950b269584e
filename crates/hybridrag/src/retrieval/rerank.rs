//! Optional post-retrieval reranking
//!
//! Reranking is strictly opt-in. Cross-encoder rerankers measurably degrade
//! refusal, injection-resistance and ambiguity behavior because they narrow
//! the diversity of the retrieved context; the default configuration keeps
//! them off and guard-relevant queries should leave them off.

use crate::error::Result;
use crate::types::Hit;

/// Rescores retrieved hits against the query
pub trait Reranker: Send + Sync {
    /// Return one score per hit, aligned by index. Higher is better.
    fn rescore(&self, query: &str, hits: &[Hit]) -> Result<Vec<f32>>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// Apply a reranker to the head of the hit list and re-sort it.
/// Ties keep the original (fused) order.
pub fn apply_rerank(
    reranker: &dyn Reranker,
    query: &str,
    mut hits: Vec<Hit>,
    top_n: usize,
) -> Result<Vec<Hit>> {
    let head_len = hits.len().min(top_n);
    if head_len < 2 {
        return Ok(hits);
    }

    let tail = hits.split_off(head_len);
    let scores = reranker.rescore(query, &hits)?;
    if scores.len() != hits.len() {
        return Err(crate::error::Error::internal(format!(
            "reranker '{}' returned {} scores for {} hits",
            reranker.name(),
            scores.len(),
            hits.len()
        )));
    }

    let mut indexed: Vec<(usize, Hit, f32)> = hits
        .into_iter()
        .zip(scores)
        .enumerate()
        .map(|(i, (hit, score))| (i, hit, score))
        .collect();
    indexed.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));

    let mut out: Vec<Hit> = indexed
        .into_iter()
        .map(|(_, mut hit, score)| {
            hit.score = score.clamp(0.0, 1.0);
            hit
        })
        .collect();
    out.extend(tail);
    for (i, hit) in out.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
    Ok(out)
}
