//! Indexer: walk a source folder, detect changes, parse and ingest
//!
//! The indexer is a serial loop over files. Within a file, text is processed
//! in bounded character blocks to cap peak memory, and chunks are embedded in
//! batches. Deterministic chunk ids plus `INSERT OR IGNORE` make the whole
//! pipeline resumable: a crash mid-file re-processes that file on the next
//! run without creating duplicates.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::storage::VectorStore;
use crate::types::{FileSignature, RunRecord, RunStatus};

use super::chunker::Chunker;
use super::parser::{non_printable_ratio, ParserRegistry};

/// Tuning knobs for an indexing run
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Also compare a content hash when size/mtime are unchanged
    pub strong_hash: bool,
    /// Reject parsed text whose non-printable ratio exceeds this
    pub binary_threshold: f32,
    /// Transient I/O retry attempts
    pub max_io_retries: u32,
    /// Base backoff delay between retries
    pub retry_base: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            strong_hash: false,
            binary_threshold: 0.3,
            max_io_retries: 3,
            retry_base: Duration::from_millis(250),
        }
    }
}

/// Why a file was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unchanged,
    NoParser,
    EmptyText,
    BinaryGarbage,
}

/// Per-file outcome of a run
#[derive(Debug, Clone)]
pub enum FileOutcome {
    Indexed { chunks: usize },
    Skipped(SkipReason),
    Failed { message: String },
}

/// Progress snapshot passed to the per-file callback
#[derive(Debug, Clone)]
pub struct IndexProgress {
    pub current: usize,
    pub total: usize,
    pub source: String,
}

/// Report for one indexing run
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub run: RunRecord,
    pub outcomes: Vec<(String, FileOutcome)>,
}

type ProgressFn = Box<dyn Fn(&IndexProgress) + Send + Sync>;

/// Folder indexer
pub struct Indexer {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: ParserRegistry,
    chunker: Chunker,
    block_chars: usize,
    batch_size: usize,
    options: IndexOptions,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
}

impl Indexer {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: ParserRegistry,
        config: &RagConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            registry,
            chunker: Chunker::new(&config.chunking),
            block_chars: config.chunking.block_chars.max(1),
            batch_size: config.embedding.batch_size.max(1),
            options: IndexOptions::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Override run options
    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    /// Install a per-file progress callback
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cooperative cancellation flag; checked between files, never mid-file
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Index every new or modified file under `folder`
    pub async fn index_folder(&self, folder: &Path) -> Result<IndexReport> {
        let files = self.scan_folder(folder)?;
        let mut run = self.store.begin_run()?;
        let mut outcomes = Vec::with_capacity(files.len());

        tracing::info!(
            run_id = %run.run_id,
            files = files.len(),
            folder = %folder.display(),
            "indexing run started"
        );

        let total = files.len();
        for (i, path) in files.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                tracing::info!(run_id = %run.run_id, "indexing cancelled");
                run.finish(RunStatus::Cancelled);
                self.store.update_run(&run)?;
                return Ok(IndexReport { run, outcomes });
            }

            let source = path.to_string_lossy().into_owned();
            if let Some(progress) = &self.progress {
                progress(&IndexProgress {
                    current: i + 1,
                    total,
                    source: source.clone(),
                });
            }

            run.files_seen += 1;
            let outcome = match self.process_file(path, &source).await {
                Ok(outcome) => outcome,
                Err(e) if is_fatal(&e) => {
                    run.finish(RunStatus::Failed);
                    self.store.update_run(&run)?;
                    return Err(e.with_context("source", source));
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "file failed, run continues");
                    FileOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            };

            match &outcome {
                FileOutcome::Indexed { chunks } => {
                    run.files_parsed += 1;
                    run.chunks_added += *chunks as u64;
                }
                FileOutcome::Skipped(_) => run.files_skipped += 1,
                FileOutcome::Failed { .. } => run.files_failed += 1,
            }
            outcomes.push((source, outcome));
            self.store.update_run(&run)?;
        }

        run.finish(RunStatus::Complete);
        self.store.update_run(&run)?;
        tracing::info!(
            run_id = %run.run_id,
            parsed = run.files_parsed,
            skipped = run.files_skipped,
            failed = run.files_failed,
            chunks = run.chunks_added,
            "indexing run complete"
        );
        Ok(IndexReport { run, outcomes })
    }

    /// Deterministic file order keeps runs and tests reproducible
    fn scan_folder(&self, folder: &Path) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = WalkDir::new(folder)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        Ok(files)
    }

    async fn process_file(&self, path: &Path, source: &str) -> Result<FileOutcome> {
        let metadata = self.read_metadata_with_retry(path).await?;
        let signature = FileSignature::from_metadata(&metadata);

        let content_hash = if self.options.strong_hash {
            Some(self.hash_file(path)?)
        } else {
            None
        };

        if let Some((stored, stored_hash)) = self.store.signature(source)? {
            let unchanged = stored == signature
                && match (&content_hash, &stored_hash) {
                    (Some(now), Some(then)) => now == then,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
            if unchanged {
                tracing::debug!(source, "unchanged, skipping");
                return Ok(FileOutcome::Skipped(SkipReason::Unchanged));
            }
            // The file changed since last indexing; drop the stale chunks so
            // search never mixes revisions of the same source.
            self.store.delete_by_source(source)?;
        }

        let parser = match self.registry.parser_for(path) {
            Some(parser) => parser,
            None => {
                tracing::debug!(source, "no parser for extension");
                return Ok(FileOutcome::Skipped(SkipReason::NoParser));
            }
        };

        let (text, diagnostics) = parser.parse(path);
        if let Some(error) = diagnostics.get("error") {
            return Ok(FileOutcome::Failed {
                message: format!("parser '{}': {}", parser.name(), error),
            });
        }
        if text.is_empty() {
            tracing::info!(source, "parser produced no text");
            return Ok(FileOutcome::Skipped(SkipReason::EmptyText));
        }
        let ratio = non_printable_ratio(&text);
        if ratio > self.options.binary_threshold {
            tracing::warn!(source, ratio, "text looks binary, skipping");
            return Ok(FileOutcome::Skipped(SkipReason::BinaryGarbage));
        }

        let mut total_chunks = 0usize;
        let mut seq = 0u32;
        for (base_offset, block) in split_blocks(&text, self.block_chars) {
            let chunks = self.chunker.chunk_text(source, block, base_offset, seq);
            seq += chunks.len() as u32;
            if chunks.is_empty() {
                continue;
            }

            for batch in chunks.chunks(self.batch_size) {
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                let vectors = self
                    .embedder
                    .embed_batch(&texts)
                    .await
                    .map_err(|e| Error::indexing(format!("embedding failed: {}", e)))?;
                total_chunks += self.store.insert_batch(batch, &vectors)?;
            }
        }
        drop(text);

        self.store
            .set_signature(source, signature, content_hash.as_deref())?;
        tracing::debug!(source, chunks = total_chunks, "file indexed");
        Ok(FileOutcome::Indexed {
            chunks: total_chunks,
        })
    }

    async fn read_metadata_with_retry(&self, path: &Path) -> Result<std::fs::Metadata> {
        let mut attempt = 0u32;
        loop {
            match std::fs::metadata(path) {
                Ok(meta) => return Ok(meta),
                Err(e) if attempt < self.options.max_io_retries => {
                    let delay = self.options.retry_base * 2u32.pow(attempt);
                    tracing::warn!(
                        path = %path.display(),
                        attempt,
                        "transient metadata read failure ({}), retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn hash_file(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Errors that abort the run rather than the file
fn is_fatal(err: &Error) -> bool {
    matches!(
        err.kind(),
        Error::Indexing(_)
            | Error::Database(_)
            | Error::StoreCorruption(_)
            | Error::Internal(_)
    )
}

/// Split text into blocks of at most `block_chars` characters, returning
/// (byte offset, block) pairs. Blocks always land on char boundaries.
fn split_blocks(text: &str, block_chars: usize) -> Vec<(usize, &str)> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut blocks = Vec::new();
    let mut start = 0usize;
    let mut count = 0usize;
    let mut last = 0usize;

    for (idx, c) in text.char_indices() {
        if count == block_chars {
            blocks.push((start, &text[start..idx]));
            start = idx;
            count = 0;
        }
        count += 1;
        last = idx + c.len_utf8();
    }
    if start < last {
        blocks.push((start, &text[start..last]));
    }
    blocks
}
