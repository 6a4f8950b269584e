//! Document ingestion: parsing, chunking and indexing

pub mod chunker;
pub mod indexer;
pub mod parser;

pub use chunker::Chunker;
pub use indexer::{FileOutcome, IndexOptions, IndexProgress, IndexReport, Indexer, SkipReason};
pub use parser::{Diagnostics, DocumentParser, ParserRegistry, PlainTextParser};
