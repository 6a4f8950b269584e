//! SQLite layer: chunks, full-text index, signatures, runs and the
//! chunk-to-row mapping
//!
//! The FTS5 index is an external-content table kept in sync with `chunks`
//! by triggers, so chunk writes and keyword search never diverge.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::{Chunk, FileSignature, RunRecord, RunStatus};

/// SQLite-backed chunk database
pub struct ChunkDb {
    conn: Arc<Mutex<Connection>>,
}

impl ChunkDb {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (tests and dry runs)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    /// Run schema migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                source TEXT NOT NULL,
                seq_index INTEGER NOT NULL,
                start INTEGER NOT NULL,
                "end" INTEGER NOT NULL,
                heading TEXT,
                metadata TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);

            -- External-content FTS index over chunk text
            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                content='chunks',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, text) VALUES (NEW.rowid, NEW.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', OLD.rowid, OLD.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', OLD.rowid, OLD.text);
                INSERT INTO chunks_fts(rowid, text) VALUES (NEW.rowid, NEW.text);
            END;

            CREATE TABLE IF NOT EXISTS file_signatures (
                source TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                content_hash TEXT,
                indexed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                files_seen INTEGER NOT NULL DEFAULT 0,
                files_skipped INTEGER NOT NULL DEFAULT 0,
                files_parsed INTEGER NOT NULL DEFAULT 0,
                files_failed INTEGER NOT NULL DEFAULT 0,
                chunks_added INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vector_mapping (
                chunk_id TEXT PRIMARY KEY,
                row_index INTEGER NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS tombstones (
                row_index INTEGER PRIMARY KEY
            );
        "#,
        )?;

        tracing::debug!("chunk database migrations complete");
        Ok(())
    }

    // ==================== Chunks & mapping ====================

    /// Committed vector row count derived from the mapping and tombstone
    /// tables. This is the recovery authority for the matrix file.
    pub fn committed_row_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let max_mapped: Option<i64> =
            conn.query_row("SELECT MAX(row_index) FROM vector_mapping", [], |r| r.get(0))?;
        let max_tombstoned: Option<i64> =
            conn.query_row("SELECT MAX(row_index) FROM tombstones", [], |r| r.get(0))?;
        let max = match (max_mapped, max_tombstoned) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        Ok(max.map(|m| m as u64 + 1).unwrap_or(0))
    }

    /// Drop chunks and mapping entries whose rows fall at or beyond `count`.
    /// Used when the matrix lost committed rows and the store must realign.
    pub fn repair_rows_beyond(&self, count: u64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM chunks WHERE id IN (SELECT chunk_id FROM vector_mapping WHERE row_index >= ?1)",
            params![count as i64],
        )?;
        let removed = conn.execute(
            "DELETE FROM vector_mapping WHERE row_index >= ?1",
            params![count as i64],
        )?;
        conn.execute(
            "DELETE FROM tombstones WHERE row_index >= ?1",
            params![count as i64],
        )?;
        Ok(removed)
    }

    /// Row index for a chunk, if it is live
    pub fn row_for_chunk(&self, chunk_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT row_index FROM vector_mapping WHERE chunk_id = ?1",
                params![chunk_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row.map(|r| r as u64))
    }

    /// Chunk ids for a set of row indexes, as (row_index, chunk_id)
    pub fn chunks_for_rows(&self, rows: &[u64]) -> Result<Vec<(u64, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT row_index, chunk_id FROM vector_mapping WHERE row_index = ?1")?;
        let mut out = Vec::with_capacity(rows.len());
        for &row in rows {
            let hit: Option<(i64, String)> = stmt
                .query_row(params![row as i64], |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()?;
            if let Some((idx, id)) = hit {
                out.push((idx as u64, id));
            }
        }
        Ok(out)
    }

    /// Hydrate chunk records, preserving the input id order
    pub fn fetch_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT id, text, source, seq_index, start, "end", heading, metadata
               FROM chunks WHERE id = ?1"#,
        )?;
        let mut out = Vec::with_capacity(chunk_ids.len());
        for id in chunk_ids {
            let chunk = stmt
                .query_row(params![id], row_to_chunk)
                .optional()?;
            if let Some(chunk) = chunk {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    /// Full-text search with OR semantics across query terms.
    ///
    /// Returns (chunk_id, bm25_score) with higher scores better. Partial
    /// matches surface because terms are OR-joined, not AND-joined.
    pub fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let fts_query = build_or_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT c.id, bm25(chunks_fts) AS score
            FROM chunks_fts f
            JOIN chunks c ON c.rowid = f.rowid
            WHERE chunks_fts MATCH ?1
            ORDER BY score
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![fts_query, limit as i64], |r| {
            let id: String = r.get(0)?;
            let score: f64 = r.get(1)?;
            // bm25() returns negative scores, lower is better.
            Ok((id, -score))
        })?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(hit) => out.push(hit),
                Err(e) => tracing::warn!("skipping unreadable FTS row: {}", e),
            }
        }
        Ok(out)
    }

    /// Remove every chunk of a source and tombstone their vector rows.
    /// Returns (chunks deleted, rows tombstoned).
    pub fn delete_by_source(&self, source: &str) -> Result<(usize, Vec<u64>)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows: Vec<u64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT m.row_index FROM vector_mapping m
                JOIN chunks c ON c.id = m.chunk_id
                WHERE c.source = ?1
                "#,
            )?;
            let found = stmt.query_map(params![source], |r| r.get::<_, i64>(0))?;
            found.filter_map(|r| r.ok()).map(|r| r as u64).collect()
        };

        for &row in &rows {
            tx.execute(
                "INSERT OR IGNORE INTO tombstones (row_index) VALUES (?1)",
                params![row as i64],
            )?;
        }
        tx.execute(
            "DELETE FROM vector_mapping WHERE chunk_id IN (SELECT id FROM chunks WHERE source = ?1)",
            params![source],
        )?;
        let deleted = tx.execute("DELETE FROM chunks WHERE source = ?1", params![source])?;
        tx.execute(
            "DELETE FROM file_signatures WHERE source = ?1",
            params![source],
        )?;

        tx.commit()?;
        tracing::info!(source, deleted, "deleted chunks for source");
        Ok((deleted, rows))
    }

    /// Tombstoned row set, consulted by the block scanner
    pub fn tombstoned_rows(&self) -> Result<HashSet<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT row_index FROM tombstones")?;
        let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
        Ok(rows.filter_map(|r| r.ok()).map(|r| r as u64).collect())
    }

    // ==================== File signatures ====================

    /// Last-seen signature for a source file, with the optional content hash
    pub fn signature(&self, source: &str) -> Result<Option<(FileSignature, Option<String>)>> {
        let conn = self.conn.lock();
        let sig = conn
            .query_row(
                "SELECT size, mtime, content_hash FROM file_signatures WHERE source = ?1",
                params![source],
                |r| {
                    Ok((
                        FileSignature {
                            size: r.get::<_, i64>(0)? as u64,
                            mtime: r.get(1)?,
                        },
                        r.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(sig)
    }

    /// Record a signature after a file indexes successfully
    pub fn set_signature(
        &self,
        source: &str,
        sig: FileSignature,
        content_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO file_signatures (source, size, mtime, content_hash, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(source) DO UPDATE SET
                size = excluded.size,
                mtime = excluded.mtime,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at
            "#,
            params![
                source,
                sig.size as i64,
                sig.mtime,
                content_hash,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Number of recorded signatures
    pub fn signature_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_signatures", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    // ==================== Run records ====================

    /// Next monotonic run sequence number
    pub fn next_run_seq(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
        Ok(count as u64 + 1)
    }

    /// Insert or update a run record
    pub fn upsert_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO runs (
                run_id, started_at, ended_at, files_seen, files_skipped,
                files_parsed, files_failed, chunks_added, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(run_id) DO UPDATE SET
                ended_at = excluded.ended_at,
                files_seen = excluded.files_seen,
                files_skipped = excluded.files_skipped,
                files_parsed = excluded.files_parsed,
                files_failed = excluded.files_failed,
                chunks_added = excluded.chunks_added,
                status = excluded.status
            "#,
            params![
                run.run_id,
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
                run.files_seen as i64,
                run.files_skipped as i64,
                run.files_parsed as i64,
                run.files_failed as i64,
                run.chunks_added as i64,
                run.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Most recent runs, newest first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, started_at, ended_at, files_seen, files_skipped,
                   files_parsed, files_failed, chunks_added, status
            FROM runs ORDER BY started_at DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_run)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ==================== Statistics ====================

    /// Store statistics for status/diag surfaces
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.conn.lock();
        let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let sources: i64 =
            conn.query_row("SELECT COUNT(DISTINCT source) FROM chunks", [], |r| r.get(0))?;
        let tombstones: i64 = conn.query_row("SELECT COUNT(*) FROM tombstones", [], |r| r.get(0))?;
        Ok(DbStats {
            chunks: chunks as usize,
            sources: sources as usize,
            tombstones: tombstones as usize,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub chunks: usize,
    pub sources: usize,
    pub tombstones: usize,
}

/// Build an OR-joined FTS5 match expression, quoting each term
pub(crate) fn build_or_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    let metadata_json: Option<String> = row.get(7)?;
    Ok(Chunk {
        id: row.get(0)?,
        text: row.get(1)?,
        source: row.get(2)?,
        seq_index: row.get::<_, i64>(3)? as u32,
        start: row.get::<_, i64>(4)? as usize,
        end: row.get::<_, i64>(5)? as usize,
        heading: row.get(6)?,
        metadata: metadata_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
    })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
    let started_at: String = row.get(1)?;
    let ended_at: Option<String> = row.get(2)?;
    let status: String = row.get(8)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        ended_at: ended_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
        }),
        files_seen: row.get::<_, i64>(3)? as u64,
        files_skipped: row.get::<_, i64>(4)? as u64,
        files_parsed: row.get::<_, i64>(5)? as u64,
        files_failed: row.get::<_, i64>(6)? as u64,
        chunks_added: row.get::<_, i64>(7)? as u64,
        status: RunStatus::parse(&status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::chunk::chunk_id;

    fn insert_chunk(db: &ChunkDb, chunk: &Chunk, row: u64) {
        let conn = db.conn().lock();
        conn.execute(
            r#"INSERT OR IGNORE INTO chunks (id, text, source, seq_index, start, "end", heading, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                chunk.id,
                chunk.text,
                chunk.source,
                chunk.seq_index as i64,
                chunk.start as i64,
                chunk.end as i64,
                chunk.heading,
                Option::<String>::None,
            ],
        )
        .unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO vector_mapping (chunk_id, row_index) VALUES (?1, ?2)",
            params![chunk.id, row as i64],
        )
        .unwrap();
    }

    fn sample(source: &str, seq: u32, text: &str) -> Chunk {
        Chunk::new(source, seq, seq as usize * 100, seq as usize * 100 + text.len(), text.to_string())
    }

    #[test]
    fn or_query_quotes_terms() {
        assert_eq!(build_or_query("maximum usable"), "\"maximum\" OR \"usable\"");
        assert_eq!(build_or_query("  "), "");
        assert_eq!(build_or_query("14-MHz"), "\"14\" OR \"MHz\"");
    }

    #[test]
    fn fts_surfaces_partial_matches() {
        let db = ChunkDb::in_memory().unwrap();
        insert_chunk(&db, &sample("a.txt", 0, "The MUF is 14 MHz at 0400 UTC"), 0);
        insert_chunk(&db, &sample("b.txt", 0, "Antenna tuning notes"), 1);

        // Only one term matches; OR semantics must still surface the chunk.
        let hits = db.fts_search("MUF nonexistentterm", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn delete_by_source_tombstones_rows() {
        let db = ChunkDb::in_memory().unwrap();
        insert_chunk(&db, &sample("a.txt", 0, "alpha bravo"), 0);
        insert_chunk(&db, &sample("a.txt", 1, "charlie delta"), 1);
        insert_chunk(&db, &sample("b.txt", 0, "echo foxtrot"), 2);

        let (deleted, rows) = db.delete_by_source("a.txt").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(db.tombstoned_rows().unwrap().len(), 2);

        // FTS no longer finds the deleted text.
        assert!(db.fts_search("alpha", 10).unwrap().is_empty());
        assert_eq!(db.fts_search("echo", 10).unwrap().len(), 1);

        // Committed count still covers the tombstoned rows.
        assert_eq!(db.committed_row_count().unwrap(), 3);
    }

    #[test]
    fn signatures_roundtrip() {
        let db = ChunkDb::in_memory().unwrap();
        let sig = FileSignature { size: 1234, mtime: 99 };
        db.set_signature("docs/x.txt", sig, Some("abc123")).unwrap();

        let (stored, hash) = db.signature("docs/x.txt").unwrap().unwrap();
        assert_eq!(stored, sig);
        assert_eq!(hash.as_deref(), Some("abc123"));
        assert!(db.signature("docs/missing.txt").unwrap().is_none());
        assert_eq!(db.signature_count().unwrap(), 1);
    }

    #[test]
    fn run_records_roundtrip() {
        let db = ChunkDb::in_memory().unwrap();
        assert_eq!(db.next_run_seq().unwrap(), 1);

        let mut run = RunRecord::begin(1);
        run.files_seen = 10;
        db.upsert_run(&run).unwrap();

        run.chunks_added = 55;
        run.finish(RunStatus::Complete);
        db.upsert_run(&run).unwrap();

        let runs = db.recent_runs(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].chunks_added, 55);
        assert_eq!(runs[0].status, RunStatus::Complete);
        assert_eq!(db.next_run_seq().unwrap(), 2);
    }

    #[test]
    fn repair_drops_rows_beyond_count() {
        let db = ChunkDb::in_memory().unwrap();
        insert_chunk(&db, &sample("a.txt", 0, "kept"), 0);
        insert_chunk(&db, &sample("a.txt", 1, "lost"), 1);

        let removed = db.repair_rows_beyond(1).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.committed_row_count().unwrap(), 1);
        assert_eq!(db.stats().unwrap().chunks, 1);
    }

    #[test]
    fn deterministic_ids_make_inserts_idempotent() {
        let db = ChunkDb::in_memory().unwrap();
        let chunk = sample("a.txt", 0, "same content");
        insert_chunk(&db, &chunk, 0);
        insert_chunk(&db, &chunk, 0);

        assert_eq!(db.stats().unwrap().chunks, 1);
        assert_eq!(chunk.id, chunk_id("a.txt", 0, 12, "same content"));
    }
}
