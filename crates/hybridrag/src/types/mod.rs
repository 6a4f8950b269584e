//! Core data types shared across the engine

pub mod chunk;
pub mod query;

pub use chunk::{chunk_id, Chunk, FileSignature, RunRecord, RunStatus};
pub use query::{Hit, LlmResponse, QueryError, QueryResult, SourceRef};
