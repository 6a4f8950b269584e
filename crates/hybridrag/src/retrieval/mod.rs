//! Hybrid retrieval: block-scanned vector search, BM25 keyword search and
//! Reciprocal Rank Fusion

pub mod fusion;
pub mod rerank;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::storage::{matrix::VectorMatrix, VectorStore};
use crate::types::{Chunk, Hit};

pub use fusion::{normalize_rrf, rrf_fuse, RRF_SCALE};
pub use rerank::Reranker;

/// Which index a search consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

/// Candidate row during the block scan; ordered by score, then by lower row
/// so equal scores keep insertion order.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    score: f32,
    row: u64,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then(other.row.cmp(&self.row))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Hybrid retriever over a [`VectorStore`]
pub struct Retriever {
    store: Arc<VectorStore>,
    config: RetrievalConfig,
    reranker: Option<Arc<dyn Reranker>>,
}

impl Retriever {
    pub fn new(store: Arc<VectorStore>, config: RetrievalConfig) -> Self {
        Self {
            store,
            config,
            reranker: None,
        }
    }

    /// Attach a reranker; it only runs when `reranker_enabled` is set
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Mode implied by the configuration
    pub fn default_mode(&self) -> SearchMode {
        if self.config.hybrid_search {
            SearchMode::Hybrid
        } else {
            SearchMode::Vector
        }
    }

    /// Top-k search. Empty result on zero matches is not an error.
    ///
    /// Results are deterministic for a fixed store and query: scores sort
    /// descending and ties break on insertion rank ascending.
    pub fn search(
        &self,
        query_text: &str,
        query_vector: &[f32],
        k: usize,
        min_score: f32,
        mode: SearchMode,
    ) -> Result<Vec<Hit>> {
        let pool = self.config.reranker_top_n.max(k);

        let mut scored: Vec<(Chunk, f32, u64)> = match mode {
            SearchMode::Vector => self
                .vector_candidates(query_vector, pool)?
                .into_iter()
                .map(|(chunk, sim, row)| (chunk, sim.clamp(0.0, 1.0), row))
                .collect(),
            SearchMode::Keyword => self
                .keyword_candidates(query_text, pool)?
                .into_iter()
                // BM25 scores are unbounded; squash into [0, 1) so the
                // shared min_score cutoff applies.
                .map(|(chunk, score, row)| {
                    let squashed = score as f32 / (score as f32 + 1.0);
                    (chunk, squashed, row)
                })
                .collect(),
            SearchMode::Hybrid => self.hybrid_candidates(query_text, query_vector, pool)?,
        };

        scored.retain(|(_, score, _)| *score >= min_score);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
        scored.truncate(k.max(self.reranker_pool_if_enabled(k)));

        let mut hits: Vec<Hit> = scored
            .into_iter()
            .enumerate()
            .map(|(i, (chunk, score, _))| Hit {
                chunk,
                score,
                rank: i + 1,
            })
            .collect();

        if self.config.reranker_enabled {
            if let Some(reranker) = &self.reranker {
                hits = rerank::apply_rerank(
                    reranker.as_ref(),
                    query_text,
                    hits,
                    self.config.reranker_top_n,
                )?;
            }
        }
        hits.truncate(k);
        for (i, hit) in hits.iter_mut().enumerate() {
            hit.rank = i + 1;
        }
        Ok(hits)
    }

    fn reranker_pool_if_enabled(&self, k: usize) -> usize {
        if self.config.reranker_enabled && self.reranker.is_some() {
            self.config.reranker_top_n.max(k)
        } else {
            k
        }
    }

    /// Brute-force cosine scan of the matrix in bounded blocks
    fn vector_candidates(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Chunk, f32, u64)>> {
        let rows = self.scan_rows(query, limit)?;
        self.hydrate(rows)
    }

    /// Top rows by cosine similarity, tombstones skipped
    fn scan_rows(&self, query: &[f32], limit: usize) -> Result<Vec<(u64, f32)>> {
        // Tombstones come from the relational store; fetch them before
        // taking the matrix guard so the two locks never nest.
        let tombstones = self.store.tombstoned_rows()?;
        let matrix = self.store.matrix();
        let count = matrix.count();
        if count == 0 || limit == 0 {
            return Ok(Vec::new());
        }
        let dim = matrix.dim();
        let block_rows = self.config.scan_block_rows.max(1);

        // Partial top-k min-heap carried across blocks.
        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(limit + 1);
        let mut row_buf: Vec<f32> = Vec::with_capacity(dim);

        let mut start = 0u64;
        while start < count {
            let len = block_rows.min((count - start) as usize);
            let block = matrix.block_bytes(start, len)?;
            for offset in 0..len {
                let row = start + offset as u64;
                if tombstones.contains(&row) {
                    continue;
                }
                VectorMatrix::decode_row(block, dim, offset, &mut row_buf);
                // Stored vectors and query are L2-normalized: the dot
                // product is the cosine.
                let score: f32 = query
                    .iter()
                    .zip(row_buf.iter())
                    .map(|(a, b)| a * b)
                    .sum();

                heap.push(Reverse(Candidate { score, row }));
                if heap.len() > limit {
                    heap.pop();
                }
            }
            start += len as u64;
        }

        let mut top: Vec<Candidate> = heap.into_iter().map(|Reverse(c)| c).collect();
        top.sort_by(|a, b| b.cmp(a));
        Ok(top.into_iter().map(|c| (c.row, c.score)).collect())
    }

    fn keyword_candidates(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(Chunk, f64, u64)>> {
        let fts = self.store.fts_search(query, limit)?;
        let mut out = Vec::with_capacity(fts.len());
        for (chunk_id, score) in fts {
            let Some(row) = self.store.insertion_rank(&chunk_id)? else {
                continue;
            };
            let mut chunks = self.store.fetch_chunks(std::slice::from_ref(&chunk_id))?;
            if let Some(chunk) = chunks.pop() {
                out.push((chunk, score, row));
            }
        }
        Ok(out)
    }

    fn hybrid_candidates(
        &self,
        query_text: &str,
        query_vector: &[f32],
        pool: usize,
    ) -> Result<Vec<(Chunk, f32, u64)>> {
        let vector_rows = self.scan_rows(query_vector, pool)?;
        let vector_hits = self.hydrate(vector_rows)?;
        let keyword_hits = self.keyword_candidates(query_text, pool)?;

        let vector_list: Vec<String> = vector_hits.iter().map(|(c, _, _)| c.id.clone()).collect();
        let keyword_list: Vec<String> = keyword_hits.iter().map(|(c, _, _)| c.id.clone()).collect();
        let fused = rrf_fuse(&[vector_list, keyword_list], self.config.rrf_k);

        let mut by_id: std::collections::HashMap<String, (Chunk, u64)> = std::collections::HashMap::new();
        for (chunk, _, row) in vector_hits {
            by_id.entry(chunk.id.clone()).or_insert((chunk, row));
        }
        for (chunk, _, row) in keyword_hits {
            by_id.entry(chunk.id.clone()).or_insert((chunk, row));
        }

        let mut out = Vec::with_capacity(by_id.len());
        for (id, (chunk, row)) in by_id {
            let raw = fused.get(&id).copied().unwrap_or(0.0);
            out.push((chunk, normalize_rrf(raw), row));
        }
        Ok(out)
    }

    fn hydrate(&self, rows: Vec<(u64, f32)>) -> Result<Vec<(Chunk, f32, u64)>> {
        let row_ids: Vec<u64> = rows.iter().map(|(r, _)| *r).collect();
        let mapping = self.store.chunks_for_rows(&row_ids)?;
        let id_by_row: std::collections::HashMap<u64, String> = mapping.into_iter().collect();

        let mut out = Vec::with_capacity(rows.len());
        for (row, score) in rows {
            let Some(chunk_id) = id_by_row.get(&row) else {
                continue;
            };
            let mut chunks = self.store.fetch_chunks(std::slice::from_ref(chunk_id))?;
            if let Some(chunk) = chunks.pop() {
                out.push((chunk, score, row));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot % dim] = 1.0;
        v
    }

    /// Vector at an angle between two axes
    fn blend(dim: usize, a: usize, b: usize, weight: f32) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[a] = weight;
        v[b] = (1.0 - weight * weight).sqrt();
        v
    }

    fn chunk(source: &str, seq: u32, text: &str) -> Chunk {
        let start = seq as usize * 1000;
        Chunk::new(source, seq, start, start + text.len(), text.to_string())
    }

    fn store_with(dim: usize, entries: &[(Chunk, Vec<f32>)]) -> Arc<VectorStore> {
        let store = Arc::new(VectorStore::open_in_memory(dim).unwrap());
        let chunks: Vec<Chunk> = entries.iter().map(|(c, _)| c.clone()).collect();
        let vectors: Vec<Vec<f32>> = entries.iter().map(|(_, v)| v.clone()).collect();
        store.insert_batch(&chunks, &vectors).unwrap();
        store
    }

    fn retriever(store: &Arc<VectorStore>) -> Retriever {
        Retriever::new(Arc::clone(store), RetrievalConfig::default())
    }

    #[test]
    fn vector_search_ranks_by_cosine() {
        let store = store_with(
            4,
            &[
                (chunk("a.txt", 0, "the exact match"), unit(4, 0)),
                (chunk("a.txt", 1, "a close match"), blend(4, 0, 1, 0.9)),
                (chunk("a.txt", 2, "unrelated"), unit(4, 2)),
            ],
        );
        let r = retriever(&store);
        let hits = r
            .search("exact", &unit(4, 0), 3, 0.0, SearchMode::Vector)
            .unwrap();

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk.text, "the exact match");
        assert!((hits[0].score - 1.0).abs() < 1e-2);
        assert_eq!(hits[1].chunk.text, "a close match");
        assert_eq!(hits[0].rank, 1);
    }

    #[test]
    fn min_score_drops_weak_hits() {
        let store = store_with(
            4,
            &[
                (chunk("a.txt", 0, "match"), unit(4, 0)),
                (chunk("a.txt", 1, "orthogonal"), unit(4, 1)),
            ],
        );
        let r = retriever(&store);
        let hits = r
            .search("match", &unit(4, 0), 5, 0.5, SearchMode::Vector)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_store_returns_empty_not_error() {
        let store = Arc::new(VectorStore::open_in_memory(4).unwrap());
        let r = retriever(&store);
        let hits = r
            .search("anything", &unit(4, 0), 5, 0.0, SearchMode::Hybrid)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn tombstoned_rows_never_surface() {
        let store = store_with(
            4,
            &[
                (chunk("dead.txt", 0, "tombstoned text"), unit(4, 0)),
                (chunk("live.txt", 0, "live text"), unit(4, 1)),
            ],
        );
        store.delete_by_source("dead.txt").unwrap();

        let r = retriever(&store);
        let hits = r
            .search("text", &unit(4, 0), 5, 0.0, SearchMode::Vector)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source, "live.txt");
    }

    #[test]
    fn block_scan_crosses_block_boundaries() {
        let dim = 4;
        let mut entries = Vec::new();
        for i in 0..10 {
            entries.push((chunk("a.txt", i, &format!("filler {}", i)), unit(dim, 1)));
        }
        // Best match lands in the last block.
        entries.push((chunk("a.txt", 10, "needle"), unit(dim, 0)));

        let store = store_with(dim, &entries);
        let mut config = RetrievalConfig::default();
        config.scan_block_rows = 3;
        let r = Retriever::new(Arc::clone(&store), config);

        let hits = r
            .search("needle", &unit(dim, 0), 1, 0.0, SearchMode::Vector)
            .unwrap();
        assert_eq!(hits[0].chunk.text, "needle");
    }

    #[test]
    fn equal_scores_break_ties_by_insertion_rank() {
        let store = store_with(
            4,
            &[
                (chunk("a.txt", 0, "first inserted"), unit(4, 0)),
                (chunk("a.txt", 1, "second inserted"), unit(4, 0)),
                (chunk("a.txt", 2, "third inserted"), unit(4, 0)),
            ],
        );
        let r = retriever(&store);
        let hits = r
            .search("inserted", &unit(4, 0), 3, 0.0, SearchMode::Vector)
            .unwrap();

        assert_eq!(hits[0].chunk.text, "first inserted");
        assert_eq!(hits[1].chunk.text, "second inserted");
        assert_eq!(hits[2].chunk.text, "third inserted");
    }

    #[test]
    fn search_is_deterministic() {
        let store = store_with(
            4,
            &[
                (chunk("a.txt", 0, "alpha beam"), blend(4, 0, 1, 0.8)),
                (chunk("a.txt", 1, "beta beam"), blend(4, 0, 2, 0.7)),
                (chunk("a.txt", 2, "gamma beam"), blend(4, 0, 3, 0.6)),
            ],
        );
        let r = retriever(&store);
        let run1 = r
            .search("beam", &unit(4, 0), 3, 0.0, SearchMode::Hybrid)
            .unwrap();
        let run2 = r
            .search("beam", &unit(4, 0), 3, 0.0, SearchMode::Hybrid)
            .unwrap();

        let ids1: Vec<_> = run1.iter().map(|h| h.chunk.id.clone()).collect();
        let ids2: Vec<_> = run2.iter().map(|h| h.chunk.id.clone()).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn hybrid_boosts_chunks_found_by_both_indexes() {
        // "doubly" matches the query keyword AND sits near the query vector;
        // "lexical" only matches the keyword; "semantic" only the vector.
        let store = store_with(
            4,
            &[
                (chunk("a.txt", 0, "doubly relevant passage"), blend(4, 0, 1, 0.95)),
                (chunk("a.txt", 1, "relevant keyword only"), unit(4, 2)),
                (chunk("a.txt", 2, "vector neighbour text"), blend(4, 0, 1, 0.9)),
            ],
        );
        let r = retriever(&store);
        let hits = r
            .search("relevant", &unit(4, 0), 3, 0.0, SearchMode::Hybrid)
            .unwrap();

        assert_eq!(hits[0].chunk.text, "doubly relevant passage");
    }

    #[test]
    fn keyword_mode_finds_exact_terms() {
        let store = store_with(
            4,
            &[
                (chunk("a.txt", 0, "The MUF is 14 MHz at 0400 UTC"), unit(4, 0)),
                (chunk("b.txt", 0, "Nothing relevant here"), unit(4, 1)),
            ],
        );
        let r = retriever(&store);
        let hits = r
            .search("MUF 14 MHz", &unit(4, 3), 5, 0.0, SearchMode::Keyword)
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.text.contains("14 MHz"));
        assert!(hits[0].score > 0.0 && hits[0].score <= 1.0);
    }

    struct FixedReranker;
    impl Reranker for FixedReranker {
        fn rescore(&self, _query: &str, hits: &[Hit]) -> Result<Vec<f32>> {
            // Prefer the lexically longest chunk.
            Ok(hits.iter().map(|h| h.chunk.text.len() as f32 / 100.0).collect())
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn reranker_only_runs_when_enabled() {
        let entries = vec![
            (chunk("a.txt", 0, "short"), unit(4, 0)),
            (chunk("a.txt", 1, "a much longer chunk of text"), blend(4, 0, 1, 0.9)),
        ];

        let store = store_with(4, &entries);
        let disabled = Retriever::new(Arc::clone(&store), RetrievalConfig::default())
            .with_reranker(Arc::new(FixedReranker));
        let hits = disabled
            .search("chunk", &unit(4, 0), 2, 0.0, SearchMode::Vector)
            .unwrap();
        assert_eq!(hits[0].chunk.text, "short");

        let mut config = RetrievalConfig::default();
        config.reranker_enabled = true;
        let enabled = Retriever::new(Arc::clone(&store), config)
            .with_reranker(Arc::new(FixedReranker));
        let hits = enabled
            .search("chunk", &unit(4, 0), 2, 0.0, SearchMode::Vector)
            .unwrap();
        assert_eq!(hits[0].chunk.text, "a much longer chunk of text");
    }
}
