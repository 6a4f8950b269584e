//! Parser registry over the uniform parse contract
//!
//! Rich format parsers (PDF, Office, email, CAD, OCR) live outside the
//! engine; each one exposes `parse(path) -> (text, diagnostics)` and must
//! never panic on malformed input — failures come back as an `error`
//! diagnostic with empty text. The engine ships reference parsers for plain
//! text and markdown, and the registry dispatches by file extension.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Diagnostics mapping produced by a parser (`error`, `chars`, `pages`,
/// format-specific keys)
pub type Diagnostics = BTreeMap<String, serde_json::Value>;

/// Uniform parser contract consumed by the indexer
pub trait DocumentParser: Send + Sync {
    /// Parse a file into text. Never panics; failures return empty text and
    /// an `error` diagnostic code.
    fn parse(&self, path: &Path) -> (String, Diagnostics);

    /// Parser name for diagnostics
    fn name(&self) -> &str;
}

/// Extension-to-parser dispatch table
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with the built-in plain-text parsers registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let plain: Arc<dyn DocumentParser> = Arc::new(PlainTextParser);
        for ext in ["txt", "text", "md", "markdown", "rst", "log", "csv"] {
            registry.register(ext, Arc::clone(&plain));
        }
        registry
    }

    /// Register a parser for an extension (case-insensitive)
    pub fn register(&mut self, extension: &str, parser: Arc<dyn DocumentParser>) {
        self.parsers
            .insert(extension.to_ascii_lowercase(), parser);
    }

    /// Look up the parser for a path, by extension
    pub fn parser_for(&self, path: &Path) -> Option<&Arc<dyn DocumentParser>> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.parsers.get(&ext)
    }

    /// Extensions the registry can handle
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.parsers.keys().cloned().collect();
        exts.sort();
        exts
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Reference parser for plain text and markdown files
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, path: &Path) -> (String, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        match std::fs::read(path) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                diagnostics.insert("chars".into(), serde_json::json!(text.chars().count()));
                (text, diagnostics)
            }
            Err(e) => {
                diagnostics.insert("error".into(), serde_json::json!(format!("io: {}", e)));
                (String::new(), diagnostics)
            }
        }
    }

    fn name(&self) -> &str {
        "plain_text"
    }
}

/// Ratio of non-printable characters; used to reject binary garbage that
/// slipped past a parser.
pub fn non_printable_ratio(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    let mut total = 0usize;
    let mut bad = 0usize;
    for c in text.chars() {
        total += 1;
        if c.is_control() && c != '\n' && c != '\r' && c != '\t' {
            bad += 1;
        } else if c == '\u{FFFD}' {
            bad += 1;
        }
    }
    bad as f32 / total as f32
}
