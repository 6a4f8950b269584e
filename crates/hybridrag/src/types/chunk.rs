//! Chunk, file signature and run record types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Derive the deterministic identifier for a chunk.
///
/// Stable across runs and platforms: re-ingesting identical content at the
/// same offsets yields the same id, which is what makes `INSERT OR IGNORE`
/// idempotent and indexing crash-safe.
pub fn chunk_id(source: &str, start: usize, end: usize, text: &str) -> String {
    let mut content_hasher = Sha256::new();
    content_hasher.update(text.as_bytes());
    let content_hash = content_hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_le_bytes());
    hasher.update(b"|");
    hasher.update(end.to_le_bytes());
    hasher.update(b"|");
    hasher.update(content_hash);
    let digest = hasher.finalize();

    hex::encode(&digest[..16])
}

/// A contiguous passage extracted from one source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic identifier (see [`chunk_id`])
    pub id: String,
    /// Text payload, including any prepended `[SECTION]` label
    pub text: String,
    /// Source file path
    pub source: String,
    /// Sequence index within the source file
    pub seq_index: u32,
    /// Byte range within the parsed text
    pub start: usize,
    pub end: usize,
    /// Section heading found by the backward scan, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    /// Format-specific metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Chunk {
    /// Create a chunk, deriving its deterministic id
    pub fn new(source: impl Into<String>, seq_index: u32, start: usize, end: usize, text: String) -> Self {
        let source = source.into();
        let id = chunk_id(&source, start, end, &text);
        Self {
            id,
            text,
            source,
            seq_index,
            start,
            end,
            heading: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a section heading and prepend its label to the payload
    pub fn with_heading(mut self, heading: String) -> Self {
        self.text = format!("[SECTION] {}\n{}", heading, self.text);
        self.heading = Some(heading);
        // The id covers the final payload, label included.
        self.id = chunk_id(&self.source, self.start, self.end, &self.text);
        self
    }
}

/// Lightweight change-detection signature for a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    /// File size in bytes
    pub size: u64,
    /// Modification time, seconds since epoch
    pub mtime: i64,
}

impl FileSignature {
    /// Read the signature from filesystem metadata
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            size: meta.len(),
            mtime,
        }
    }
}

/// Terminal status of an indexing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "complete" => Self::Complete,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// One record per indexing run, used for audit and resumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Monotonic sequence + UUID, e.g. `42-9f0c…`
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub files_seen: u64,
    pub files_skipped: u64,
    pub files_parsed: u64,
    pub files_failed: u64,
    pub chunks_added: u64,
    pub status: RunStatus,
}

impl RunRecord {
    /// Start a new run record with the given monotonic sequence number
    pub fn begin(seq: u64) -> Self {
        Self {
            run_id: format!("{}-{}", seq, Uuid::new_v4()),
            started_at: Utc::now(),
            ended_at: None,
            files_seen: 0,
            files_skipped: 0,
            files_parsed: 0,
            files_failed: 0,
            chunks_added: 0,
            status: RunStatus::Running,
        }
    }

    /// Close the record with a terminal status
    pub fn finish(&mut self, status: RunStatus) {
        self.ended_at = Some(Utc::now());
        self.status = status;
    }
}
