//! Query-side types: hits, LLM responses and the packaged query result

use serde::{Deserialize, Serialize};

use super::chunk::Chunk;

/// A retrieved chunk with its fused score and final rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    /// The retrieved chunk
    pub chunk: Chunk,
    /// Normalized score in [0, 1], higher is better
    pub score: f32,
    /// 1-based rank in the final list
    pub rank: usize,
}

impl Hit {
    /// Format a citation line for this hit
    pub fn format_citation(&self) -> String {
        let mut parts = vec![self.chunk.source.clone()];
        if let Some(heading) = &self.chunk.heading {
            parts.push(format!("Section: {}", heading));
        }
        parts.push(format!("chunk {}", self.chunk.seq_index));
        format!("[Source: {}]", parts.join(", "))
    }
}

/// Structured response from an LLM backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated answer text
    pub answer_text: String,
    /// Prompt tokens consumed
    pub tokens_in: u64,
    /// Completion tokens produced
    pub tokens_out: u64,
    /// Wall-clock latency of the final attempt
    pub latency_ms: u64,
    /// Number of retries before success
    pub retry_count: u32,
}

/// Compact source reference packaged with a query result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub source: String,
    pub seq_index: u32,
    pub score: f32,
    /// Leading slice of the chunk text
    pub snippet: String,
}

impl SourceRef {
    /// Build a source reference from a hit
    pub fn from_hit(hit: &Hit) -> Self {
        let snippet: String = hit.chunk.text.chars().take(240).collect();
        Self {
            chunk_id: hit.chunk.id.clone(),
            source: hit.chunk.source.clone(),
            seq_index: hit.chunk.seq_index,
            score: hit.score,
            snippet,
        }
    }
}

/// Error summary carried inside a query result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryError {
    /// Stable error code from the shared taxonomy
    pub code: String,
    /// Human-readable message (secrets always masked)
    pub message: String,
    /// Remediation hint
    pub remediation: String,
}

impl QueryError {
    pub fn from_error(err: &crate::error::Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            remediation: err.remediation().to_string(),
        }
    }
}

/// Packaged result of one query. Every exit path of the engine produces one
/// of these; errors never propagate past the engine boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Final answer text (possibly a guard rewrite or a refusal)
    pub answer_text: String,
    /// Sources backing the answer, best first
    pub sources: Vec<SourceRef>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    /// False when the hallucination guard rewrote or flagged the answer
    pub is_safe: bool,
    /// Present when the query terminated on an error path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl QueryResult {
    /// Result for the no-relevant-documents path; the LLM is never called
    pub fn no_documents(latency_ms: u64) -> Self {
        Self {
            answer_text: "No relevant documents were found for this question.".to_string(),
            sources: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            latency_ms,
            is_safe: true,
            error: None,
        }
    }

    /// Result for an error path, carrying whatever retrieval produced
    pub fn from_failure(err: &crate::error::Error, sources: Vec<SourceRef>, latency_ms: u64) -> Self {
        Self {
            answer_text: String::new(),
            sources,
            tokens_in: 0,
            tokens_out: 0,
            latency_ms,
            is_safe: true,
            error: Some(QueryError::from_error(err)),
        }
    }
}
