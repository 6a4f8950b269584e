//! Dual-store persistence: relational chunks plus a memory-mapped matrix
//!
//! The two halves are kept aligned by the `vector_mapping` table. Inserts
//! append matrix rows first and commit the relational transaction second,
//! so a crash at any point leaves either the whole batch or none of it —
//! uncommitted matrix bytes are truncated on the next open.

pub mod database;
pub mod matrix;

use std::collections::HashSet;
use std::path::Path;

use parking_lot::{RwLock, RwLockReadGuard};
use rusqlite::params;

use crate::config::PathsConfig;
use crate::error::{Error, Result};
use crate::types::{Chunk, FileSignature, RunRecord};

pub use database::{ChunkDb, DbStats};
pub use matrix::{MatrixMeta, VectorMatrix};

/// Store statistics for status surfaces
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub chunks: usize,
    pub sources: usize,
    pub tombstones: usize,
    pub vectors: u64,
}

/// The persistence layer: chunk rows, full-text index and vector matrix
pub struct VectorStore {
    db: ChunkDb,
    matrix: RwLock<VectorMatrix>,
    dim: usize,
    /// Recovery warnings gathered at open time
    warnings: Vec<String>,
    /// Keeps the backing directory alive for in-memory stores
    _scratch: Option<tempfile::TempDir>,
}

impl VectorStore {
    /// Open or initialize the store. `dim` is read from the embedder at
    /// load time, never hard-coded.
    pub fn open(paths: &PathsConfig, dim: usize) -> Result<Self> {
        let db = ChunkDb::open(&paths.database_file)?;
        Self::assemble(db, &paths.vector_matrix_file, &paths.vector_meta_file, dim, None)
    }

    /// Fully in-memory/on-scratch store for tests and dry runs
    pub fn open_in_memory(dim: usize) -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        let db = ChunkDb::in_memory()?;
        let matrix_path = scratch.path().join("vectors.bin");
        let meta_path = scratch.path().join("vectors_meta.json");
        Self::assemble(db, &matrix_path, &meta_path, dim, Some(scratch))
    }

    fn assemble(
        db: ChunkDb,
        matrix_path: &Path,
        meta_path: &Path,
        dim: usize,
        scratch: Option<tempfile::TempDir>,
    ) -> Result<Self> {
        let committed = db.committed_row_count()?;
        let matrix = VectorMatrix::open(matrix_path, meta_path, dim, Some(committed))?;

        let mut warnings = Vec::new();
        if let Some(w) = &matrix.recovery_warning {
            warnings.push(w.clone());
        }

        // The matrix may have salvaged fewer rows than the mapping recorded;
        // drop the orphaned chunks so the alignment invariant holds.
        if matrix.count() < committed {
            let removed = db.repair_rows_beyond(matrix.count())?;
            let warning = format!(
                "removed {} chunk(s) whose vectors were lost; re-index the affected sources",
                removed
            );
            tracing::warn!("{}", warning);
            warnings.push(warning);
        }

        Ok(Self {
            db,
            matrix: RwLock::new(matrix),
            dim,
            warnings,
            _scratch: scratch,
        })
    }

    /// Embedding dimension the store was opened with
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Warnings produced while opening (recovery, truncation)
    pub fn open_warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Committed vector row count (tombstoned rows included)
    pub fn vector_count(&self) -> u64 {
        self.matrix.read().count()
    }

    /// Read access to the matrix for block scanning
    pub fn matrix(&self) -> RwLockReadGuard<'_, VectorMatrix> {
        self.matrix.read()
    }

    /// The relational half of the store
    pub fn db(&self) -> &ChunkDb {
        &self.db
    }

    /// Insert chunks and their vectors atomically.
    ///
    /// Chunks whose deterministic id is already present are ignored — this
    /// is what makes re-indexing idempotent and crash resume duplicate-free.
    /// Returns the number of newly inserted chunks.
    pub fn insert_batch(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<usize> {
        if chunks.len() != vectors.len() {
            return Err(Error::internal(format!(
                "insert_batch got {} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let conn = self.db.conn().clone();
        let mut conn = conn.lock();
        let mut matrix = self.matrix.write();

        let tx = conn.transaction()?;
        let mut fresh: Vec<(&Chunk, &Vec<f32>)> = Vec::new();
        {
            let mut stmt = tx.prepare(
                r#"INSERT OR IGNORE INTO chunks (id, text, source, seq_index, start, "end", heading, metadata)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            )?;
            for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                let metadata = if chunk.metadata.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&chunk.metadata)?)
                };
                let inserted = stmt.execute(params![
                    chunk.id,
                    chunk.text,
                    chunk.source,
                    chunk.seq_index as i64,
                    chunk.start as i64,
                    chunk.end as i64,
                    chunk.heading,
                    metadata,
                ])?;
                if inserted == 1 {
                    fresh.push((chunk, vector));
                }
            }
        }

        if fresh.is_empty() {
            tx.commit()?;
            return Ok(0);
        }

        let base_row = matrix.count();
        let fresh_vectors: Vec<Vec<f32>> = fresh.iter().map(|(_, v)| (*v).clone()).collect();
        let new_count = match matrix.append_rows(&fresh_vectors) {
            Ok(count) => count,
            Err(e) => {
                matrix.rollback_to_committed()?;
                return Err(e);
            }
        };

        {
            let mut stmt = tx
                .prepare("INSERT INTO vector_mapping (chunk_id, row_index) VALUES (?1, ?2)")?;
            for (offset, (chunk, _)) in fresh.iter().enumerate() {
                stmt.execute(params![chunk.id, (base_row + offset as u64) as i64])?;
            }
        }

        if let Err(e) = tx.commit() {
            matrix.rollback_to_committed()?;
            return Err(e.into());
        }
        matrix.commit_count(new_count)?;

        Ok(fresh.len())
    }

    /// Remove a source's chunks and tombstone their vector rows
    pub fn delete_by_source(&self, source: &str) -> Result<usize> {
        let (deleted, rows) = self.db.delete_by_source(source)?;
        if !rows.is_empty() {
            tracing::debug!(source, rows = rows.len(), "tombstoned vector rows");
        }
        Ok(deleted)
    }

    /// Full-text search with OR semantics
    pub fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        self.db.fts_search(query, limit)
    }

    /// Hydrate chunk records in input order
    pub fn fetch_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        self.db.fetch_chunks(chunk_ids)
    }

    /// Tombstoned rows to skip during scans
    pub fn tombstoned_rows(&self) -> Result<HashSet<u64>> {
        self.db.tombstoned_rows()
    }

    /// Insertion rank of a chunk (its vector row), if live
    pub fn insertion_rank(&self, chunk_id: &str) -> Result<Option<u64>> {
        self.db.row_for_chunk(chunk_id)
    }

    /// Map row indexes back to chunk ids
    pub fn chunks_for_rows(&self, rows: &[u64]) -> Result<Vec<(u64, String)>> {
        self.db.chunks_for_rows(rows)
    }

    /// Last-seen signature for a file, with its optional content hash
    pub fn signature(&self, source: &str) -> Result<Option<(FileSignature, Option<String>)>> {
        self.db.signature(source)
    }

    /// Record a file's signature after successful indexing
    pub fn set_signature(
        &self,
        source: &str,
        sig: FileSignature,
        content_hash: Option<&str>,
    ) -> Result<()> {
        self.db.set_signature(source, sig, content_hash)
    }

    /// Begin a run record with the next monotonic sequence
    pub fn begin_run(&self) -> Result<RunRecord> {
        let seq = self.db.next_run_seq()?;
        let run = RunRecord::begin(seq);
        self.db.upsert_run(&run)?;
        Ok(run)
    }

    /// Persist the current state of a run record
    pub fn update_run(&self, run: &RunRecord) -> Result<()> {
        self.db.upsert_run(run)
    }

    /// Most recent runs, newest first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.db.recent_runs(limit)
    }

    /// Store statistics
    pub fn stats(&self) -> Result<StoreStats> {
        let db = self.db.stats()?;
        Ok(StoreStats {
            chunks: db.chunks,
            sources: db.sources,
            tombstones: db.tombstones,
            vectors: self.vector_count(),
        })
    }

    /// Flush buffered state; call before dropping on clean shutdown
    pub fn close(&self) -> Result<()> {
        self.matrix.write().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot % dim] = 1.0;
        v
    }

    fn chunk(source: &str, seq: u32, text: &str) -> Chunk {
        let start = seq as usize * 1000;
        Chunk::new(source, seq, start, start + text.len(), text.to_string())
    }

    #[test]
    fn insert_batch_aligns_rows_and_mapping() {
        let store = VectorStore::open_in_memory(4).unwrap();
        let chunks = vec![chunk("a.txt", 0, "first"), chunk("a.txt", 1, "second")];
        let vectors = vec![unit(4, 0), unit(4, 1)];

        let added = store.insert_batch(&chunks, &vectors).unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.vector_count(), 2);

        let row = store.insertion_rank(&chunks[1].id).unwrap().unwrap();
        assert_eq!(row, 1);
        let matrix = store.matrix();
        assert_eq!(matrix.row(row).unwrap(), unit(4, 1));
    }

    #[test]
    fn reinsert_is_idempotent() {
        let store = VectorStore::open_in_memory(4).unwrap();
        let chunks = vec![chunk("a.txt", 0, "alpha"), chunk("a.txt", 1, "bravo")];
        let vectors = vec![unit(4, 0), unit(4, 1)];

        assert_eq!(store.insert_batch(&chunks, &vectors).unwrap(), 2);
        assert_eq!(store.insert_batch(&chunks, &vectors).unwrap(), 0);
        assert_eq!(store.vector_count(), 2);
        assert_eq!(store.stats().unwrap().chunks, 2);
    }

    #[test]
    fn partial_overlap_only_appends_new_rows() {
        let store = VectorStore::open_in_memory(4).unwrap();
        let first = vec![chunk("a.txt", 0, "alpha")];
        store.insert_batch(&first, &[unit(4, 0)]).unwrap();

        // A resumed run re-offers the old chunk together with a new one.
        let resumed = vec![chunk("a.txt", 0, "alpha"), chunk("a.txt", 1, "bravo")];
        let added = store
            .insert_batch(&resumed, &[unit(4, 0), unit(4, 1)])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.vector_count(), 2);
    }

    #[test]
    fn delete_by_source_hides_rows_from_scan() {
        let store = VectorStore::open_in_memory(4).unwrap();
        let chunks = vec![
            chunk("a.txt", 0, "alpha"),
            chunk("b.txt", 0, "bravo"),
        ];
        store
            .insert_batch(&chunks, &[unit(4, 0), unit(4, 1)])
            .unwrap();

        let deleted = store.delete_by_source("a.txt").unwrap();
        assert_eq!(deleted, 1);

        let tombstones = store.tombstoned_rows().unwrap();
        assert!(tombstones.contains(&0));
        // Rows are never moved; the file still holds both.
        assert_eq!(store.vector_count(), 2);
        assert_eq!(store.stats().unwrap().chunks, 1);
    }

    #[test]
    fn crash_between_append_and_commit_recovers_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            database_file: dir.path().join("chunks.db"),
            vector_matrix_file: dir.path().join("vectors.bin"),
            vector_meta_file: dir.path().join("vectors_meta.json"),
            source_folder: dir.path().to_path_buf(),
        };

        {
            let store = VectorStore::open(&paths, 4).unwrap();
            store
                .insert_batch(&[chunk("a.txt", 0, "alpha")], &[unit(4, 0)])
                .unwrap();
            // Simulate a crash mid-batch: rows hit the file but the
            // relational transaction never committed.
            let mut matrix = store.matrix.write();
            matrix.append_rows(&[unit(4, 1), unit(4, 2)]).unwrap();
        }

        let store = VectorStore::open(&paths, 4).unwrap();
        assert_eq!(store.vector_count(), 1);
        assert_eq!(store.stats().unwrap().chunks, 1);
        assert!(store
            .insert_batch(&[chunk("a.txt", 1, "bravo")], &[unit(4, 1)])
            .is_ok());
        assert_eq!(store.vector_count(), 2);
    }

    #[test]
    fn lost_matrix_rows_drop_orphaned_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            database_file: dir.path().join("chunks.db"),
            vector_matrix_file: dir.path().join("vectors.bin"),
            vector_meta_file: dir.path().join("vectors_meta.json"),
            source_folder: dir.path().to_path_buf(),
        };

        {
            let store = VectorStore::open(&paths, 4).unwrap();
            store
                .insert_batch(
                    &[chunk("a.txt", 0, "alpha"), chunk("a.txt", 1, "bravo")],
                    &[unit(4, 0), unit(4, 1)],
                )
                .unwrap();
        }
        // Truncate the matrix to one row behind the store's back.
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(&paths.vector_matrix_file)
            .unwrap();
        f.set_len(4 * 2).unwrap();
        drop(f);

        let store = VectorStore::open(&paths, 4).unwrap();
        assert!(!store.open_warnings().is_empty());
        assert_eq!(store.vector_count(), 1);
        assert_eq!(store.stats().unwrap().chunks, 1);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            database_file: dir.path().join("chunks.db"),
            vector_matrix_file: dir.path().join("vectors.bin"),
            vector_meta_file: dir.path().join("vectors_meta.json"),
            source_folder: dir.path().to_path_buf(),
        };

        let id = {
            let store = VectorStore::open(&paths, 4).unwrap();
            let c = chunk("a.txt", 0, "persisted text");
            store.insert_batch(&[c.clone()], &[unit(4, 0)]).unwrap();
            store.close().unwrap();
            c.id
        };

        let store = VectorStore::open(&paths, 4).unwrap();
        let fetched = store.fetch_chunks(&[id]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].text, "persisted text");
        assert_eq!(store.vector_count(), 1);
    }
}
