//! hybridrag: local-first hybrid Retrieval-Augmented Generation engine
//!
//! Indexes heterogeneous document collections into a dual store (SQLite +
//! memory-mapped vector matrix), answers questions with hybrid vector/BM25
//! retrieval fused by Reciprocal Rank Fusion, and routes prompts to a local
//! inference server or a single approved remote API. Every outbound
//! connection is mediated by a network allowlist, and online responses pass
//! through a claim-level hallucination guard before they reach the caller.

pub mod boot;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod guard;
pub mod ingestion;
pub mod llm;
pub mod retrieval;
pub mod security;
pub mod storage;
pub mod types;

pub use boot::{BootPipeline, BootResult};
pub use config::{GateMode, RagConfig};
pub use engine::QueryEngine;
pub use error::{Error, Result};
pub use guard::HallucinationGuard;
pub use ingestion::{Indexer, ParserRegistry};
pub use llm::{LlmRouter, RouteMode};
pub use retrieval::{Retriever, SearchMode};
pub use security::{CredentialResolver, NetworkGate};
pub use storage::VectorStore;
pub use types::{Chunk, Hit, QueryResult};
