//! Memory-mapped vector matrix with a JSON sidecar
//!
//! Vectors are stored as a contiguous row-major [N, D] matrix of
//! half-precision floats. Rows are append-only; deletion tombstones rows in
//! the relational store and never rewrites this file. The sidecar records
//! `{dim, count, dtype}` and is the authority for how many rows are
//! committed; bytes past `count` rows are crash leftovers and are truncated
//! on open.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use half::f16;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DTYPE: &str = "float16";

/// Bytes per stored scalar
const SCALAR_BYTES: usize = 2;

/// Sidecar metadata validated on open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixMeta {
    pub dim: usize,
    pub count: u64,
    pub dtype: String,
}

/// Append-only on-disk matrix of embedding vectors
#[derive(Debug)]
pub struct VectorMatrix {
    file: File,
    mmap: Option<Mmap>,
    meta: MatrixMeta,
    meta_path: PathBuf,
    /// Set when open() had to repair the store
    pub recovery_warning: Option<String>,
}

impl VectorMatrix {
    /// Open or initialize the matrix.
    ///
    /// `dim` comes from the embedder at load time. `db_count` is the row
    /// count recorded in the relational mapping table. The mapping is the
    /// commit authority: when present it overrides the sidecar count, and it
    /// stands in for the sidecar entirely when the sidecar is unparseable.
    pub fn open(
        matrix_path: &Path,
        meta_path: &Path,
        dim: usize,
        db_count: Option<u64>,
    ) -> Result<Self> {
        if dim == 0 {
            return Err(Error::internal("vector dimension must be non-zero"));
        }
        if let Some(parent) = matrix_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Append mode keeps every write at the end of the file, including
        // after a recovery truncation.
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(matrix_path)?;
        let file_len = file.metadata()?.len();
        let stride = (dim * SCALAR_BYTES) as u64;

        let mut recovery_warning = None;

        let mut meta = match read_meta(meta_path) {
            MetaState::Valid(meta) => {
                if meta.dtype != DTYPE {
                    return Err(Error::StoreCorruption(format!(
                        "Sidecar dtype '{}' is not '{}'",
                        meta.dtype, DTYPE
                    )));
                }
                if meta.dim != dim {
                    return Err(Error::StoreCorruption(format!(
                        "Sidecar dimension {} does not match embedder dimension {}",
                        meta.dim, dim
                    )));
                }
                meta
            }
            MetaState::Missing if file_len == 0 => MatrixMeta {
                dim,
                count: 0,
                dtype: DTYPE.to_string(),
            },
            // Unparseable (or missing with data present): structured-format
            // corruption. Rebuild the sidecar when the count is inferable;
            // otherwise refuse and require administrative intervention.
            MetaState::Missing | MetaState::Corrupt => {
                let inferred = db_count.or_else(|| {
                    (file_len % stride == 0).then_some(file_len / stride)
                });
                match inferred {
                    Some(count) if count * stride <= file_len => {
                        let warning = format!(
                            "vector sidecar '{}' was unreadable; rebuilt with inferred count {}",
                            meta_path.display(),
                            count
                        );
                        tracing::warn!("{}", warning);
                        recovery_warning = Some(warning);
                        MatrixMeta {
                            dim,
                            count,
                            dtype: DTYPE.to_string(),
                        }
                    }
                    _ => {
                        return Err(Error::StoreCorruption(format!(
                            "Sidecar '{}' is unreadable and the row count cannot be inferred",
                            meta_path.display()
                        )))
                    }
                }
            }
        };

        // The mapping table records what actually committed; a sidecar that
        // disagrees lagged a crash on one side of the commit point.
        if let Some(committed) = db_count {
            if meta.count != committed {
                tracing::warn!(
                    "sidecar count {} disagrees with mapping count {}; using the mapping",
                    meta.count,
                    committed
                );
                meta.count = committed;
            }
        }

        let mut matrix = Self {
            file,
            mmap: None,
            meta,
            meta_path: meta_path.to_path_buf(),
            recovery_warning,
        };

        let committed = matrix.meta.count * stride;
        if file_len > committed {
            // Rows appended by a run that never committed its transaction.
            tracing::warn!(
                "truncating {} uncommitted byte(s) from '{}'",
                file_len - committed,
                matrix_path.display()
            );
            matrix.file.set_len(committed)?;
        } else if file_len < committed {
            // The file lost committed rows; keep what is recoverable and
            // report the loss rather than refusing every future open.
            let salvageable = file_len / stride;
            let warning = format!(
                "matrix '{}' holds {} row(s) but the sidecar recorded {}; store truncated, {} row(s) lost",
                matrix_path.display(),
                salvageable,
                matrix.meta.count,
                matrix.meta.count - salvageable
            );
            tracing::warn!("{}", warning);
            matrix.meta.count = salvageable;
            matrix.file.set_len(salvageable * stride)?;
            matrix.recovery_warning = Some(warning);
        }

        matrix.persist_meta()?;
        matrix.remap()?;
        Ok(matrix)
    }

    /// Embedding dimension
    pub fn dim(&self) -> usize {
        self.meta.dim
    }

    /// Committed row count
    pub fn count(&self) -> u64 {
        self.meta.count
    }

    /// Append rows to the file without committing them.
    ///
    /// Vectors become visible (and survive a crash) only after
    /// [`commit_count`] persists the new count — callers append first, then
    /// commit alongside the relational transaction.
    pub fn append_rows(&mut self, vectors: &[Vec<f32>]) -> Result<u64> {
        let mut buf = Vec::with_capacity(vectors.len() * self.meta.dim * SCALAR_BYTES);
        for vector in vectors {
            if vector.len() != self.meta.dim {
                return Err(Error::internal(format!(
                    "vector has dimension {}, matrix expects {}",
                    vector.len(),
                    self.meta.dim
                )));
            }
            for &value in vector {
                buf.extend_from_slice(&f16::from_f32(value).to_le_bytes());
            }
        }

        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(self.meta.count + vectors.len() as u64)
    }

    /// Persist the new committed count and refresh the mapping
    pub fn commit_count(&mut self, count: u64) -> Result<()> {
        self.meta.count = count;
        self.persist_meta()?;
        self.file.sync_data()?;
        self.remap()
    }

    /// Discard appended-but-uncommitted rows after a failed transaction
    pub fn rollback_to_committed(&mut self) -> Result<()> {
        let committed = self.meta.count * (self.meta.dim * SCALAR_BYTES) as u64;
        self.file.set_len(committed)?;
        self.remap()
    }

    /// Zero-copy view of `len` rows starting at `start`, as raw f16 bytes
    pub fn block_bytes(&self, start: u64, len: usize) -> Result<&[u8]> {
        let stride = self.meta.dim * SCALAR_BYTES;
        let end = start + len as u64;
        if end > self.meta.count {
            return Err(Error::internal(format!(
                "block [{}, {}) exceeds committed count {}",
                start, end, self.meta.count
            )));
        }
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| Error::internal("matrix is not mapped"))?;
        let byte_start = start as usize * stride;
        let byte_end = end as usize * stride;
        Ok(&mmap[byte_start..byte_end])
    }

    /// Decode one row of a block into `out` as f32
    pub fn decode_row(block: &[u8], dim: usize, row: usize, out: &mut Vec<f32>) {
        out.clear();
        let stride = dim * SCALAR_BYTES;
        let bytes = &block[row * stride..(row + 1) * stride];
        for pair in bytes.chunks_exact(SCALAR_BYTES) {
            out.push(f16::from_le_bytes([pair[0], pair[1]]).to_f32());
        }
    }

    /// Read a single committed row as f32
    pub fn row(&self, index: u64) -> Result<Vec<f32>> {
        let block = self.block_bytes(index, 1)?;
        let mut out = Vec::with_capacity(self.meta.dim);
        Self::decode_row(block, self.meta.dim, 0, &mut out);
        Ok(out)
    }

    /// Flush file contents and metadata
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.persist_meta()
    }

    fn remap(&mut self) -> Result<()> {
        self.mmap = None;
        let len = self.file.metadata()?.len();
        if len > 0 {
            self.mmap = Some(unsafe { Mmap::map(&self.file)? });
        }
        Ok(())
    }

    fn persist_meta(&self) -> Result<()> {
        let tmp = self.meta_path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&self.meta)?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_data()?;
        }
        std::fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

enum MetaState {
    Valid(MatrixMeta),
    Missing,
    Corrupt,
}

fn read_meta(path: &Path) -> MetaState {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<MatrixMeta>(&text) {
            Ok(meta) => MetaState::Valid(meta),
            Err(_) => MetaState::Corrupt,
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MetaState::Missing,
        Err(_) => MetaState::Corrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (
            dir.path().join("vectors.bin"),
            dir.path().join("vectors_meta.json"),
        )
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn append_commit_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        let mut m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();

        let next = m.append_rows(&[unit(4, 0), unit(4, 2)]).unwrap();
        m.commit_count(next).unwrap();

        assert_eq!(m.count(), 2);
        assert_eq!(m.row(0).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(m.row(1).unwrap(), vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn uncommitted_rows_are_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        {
            let mut m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
            let next = m.append_rows(&[unit(4, 0)]).unwrap();
            m.commit_count(next).unwrap();
            // Simulate a crash between append and commit.
            m.append_rows(&[unit(4, 1), unit(4, 2)]).unwrap();
        }

        let m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
        assert_eq!(m.count(), 1);
        assert_eq!(std::fs::metadata(&mp).unwrap().len(), 4 * 2);
    }

    #[test]
    fn corrupt_sidecar_rebuilt_when_count_inferable() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        {
            let mut m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
            let next = m.append_rows(&[unit(4, 0), unit(4, 1)]).unwrap();
            m.commit_count(next).unwrap();
        }
        std::fs::write(&sp, b"{ not json").unwrap();

        let m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
        assert_eq!(m.count(), 2);
        assert!(m.recovery_warning.is_some());
    }

    #[test]
    fn corrupt_sidecar_with_ragged_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        // 5 bytes is not a whole number of rows for any dimension.
        std::fs::write(&mp, b"\x01\x02\x03\x04\x05").unwrap();
        std::fs::write(&sp, b"garbage").unwrap();

        let err = VectorMatrix::open(&mp, &sp, 4, None).unwrap_err();
        assert_eq!(err.code(), "store_corruption");
    }

    #[test]
    fn count_hint_wins_over_file_length_inference() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        {
            let mut m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
            let next = m.append_rows(&[unit(4, 0), unit(4, 1), unit(4, 2)]).unwrap();
            m.commit_count(next).unwrap();
        }
        std::fs::write(&sp, b"garbage").unwrap();

        // The mapping table only ever saw two committed rows.
        let m = VectorMatrix::open(&mp, &sp, 4, Some(2)).unwrap();
        assert_eq!(m.count(), 2);
    }

    #[test]
    fn dimension_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        {
            let mut m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
            let next = m.append_rows(&[unit(4, 0)]).unwrap();
            m.commit_count(next).unwrap();
        }

        let err = VectorMatrix::open(&mp, &sp, 8, None).unwrap_err();
        assert_eq!(err.code(), "store_corruption");
    }

    #[test]
    fn rollback_discards_appended_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        let mut m = VectorMatrix::open(&mp, &sp, 4, None).unwrap();
        m.append_rows(&[unit(4, 0)]).unwrap();
        m.rollback_to_committed().unwrap();

        assert_eq!(m.count(), 0);
        assert_eq!(std::fs::metadata(&mp).unwrap().len(), 0);
    }

    #[test]
    fn half_precision_roundtrip_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let (mp, sp) = paths(&dir);
        let mut m = VectorMatrix::open(&mp, &sp, 3, None).unwrap();
        let v = vec![0.1234, -0.5678, 0.9012];
        let next = m.append_rows(std::slice::from_ref(&v)).unwrap();
        m.commit_count(next).unwrap();

        let back = m.row(0).unwrap();
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-2, "{} vs {}", a, b);
        }
    }
}
