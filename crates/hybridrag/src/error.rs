//! Error types for the engine
//!
//! Every error carries a stable code and a remediation hint so that the
//! outermost layers (QueryEngine, Indexer, BootPipeline) can surface
//! actionable diagnostics without leaking internals or secrets.

use std::collections::BTreeMap;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No credential available where one is required
    #[error("Credential error: {0}")]
    Credential(String),

    /// The network gate denied an outbound URL
    #[error("Network blocked: {url} (mode: {mode})")]
    NetworkBlocked { url: String, mode: String },

    /// Remote backend rejected the credential (401/403)
    #[error("Authentication rejected by {backend}: HTTP {status}")]
    AuthRejected { backend: String, status: u16 },

    /// Backend signalled a rate limit
    #[error("Rate limited by {backend}: {message}")]
    RateLimited { backend: String, message: String },

    /// Backend exceeded its configured timeout
    #[error("Request to {backend} timed out after {timeout_secs}s")]
    TimedOut { backend: String, timeout_secs: u64 },

    /// Backend returned an empty or malformed body
    #[error("Invalid response from {backend}: {message}")]
    InvalidResponse { backend: String, message: String },

    /// A parser returned an error diagnostic for a file
    #[error("Failed to parse file '{source_path}': {message}")]
    Parse { source_path: String, message: String },

    /// Persistent store is corrupt beyond structured recovery
    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    /// Unrecoverable error during an indexing run
    #[error("Indexing error: {0}")]
    Indexing(String),

    /// Embedding generation failed
    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    /// NLI verification failed
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error annotated with caller-supplied context
    #[error("{source}")]
    WithContext {
        #[source]
        source: Box<Error>,
        context: BTreeMap<String, String>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a credential error
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    /// Create a parse error for a file
    pub fn parse(source_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_path: source_path.into(),
            message: message.into(),
        }
    }

    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create an indexing error
    pub fn indexing(message: impl Into<String>) -> Self {
        Self::Indexing(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Attach a key/value context entry, wrapping if necessary
    pub fn with_context(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            Self::WithContext {
                source,
                mut context,
            } => {
                context.insert(key.into(), value.into());
                Self::WithContext { source, context }
            }
            other => {
                let mut context = BTreeMap::new();
                context.insert(key.into(), value.into());
                Self::WithContext {
                    source: Box::new(other),
                    context,
                }
            }
        }
    }

    /// The underlying error kind, unwrapping any context layers
    pub fn kind(&self) -> &Error {
        match self {
            Self::WithContext { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Caller-supplied context entries, if any
    pub fn context(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::WithContext { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self.kind() {
            Self::Config(_) => "config_error",
            Self::Credential(_) => "credential_error",
            Self::NetworkBlocked { .. } => "network_blocked",
            Self::AuthRejected { .. } => "auth_rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::TimedOut { .. } => "timed_out",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Parse { .. } => "parse_error",
            Self::StoreCorruption(_) => "store_corruption",
            Self::Indexing(_) => "indexing_error",
            Self::Embedding(_) => "embedding_error",
            Self::Verification(_) => "verification_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Http(_) => "http_error",
            Self::Internal(_) => "internal_error",
            Self::WithContext { .. } => unreachable!("kind() unwraps context"),
        }
    }

    /// Human-readable remediation hint. Never includes secrets.
    pub fn remediation(&self) -> &'static str {
        match self.kind() {
            Self::Config(_) => {
                "Check the configuration file against the documented sections and value ranges."
            }
            Self::Credential(_) => {
                "Store an API key with `cred-store`, or set the HYBRIDRAG_API_* environment variables."
            }
            Self::NetworkBlocked { .. } => {
                "The URL is outside the active allowlist. Switch to online mode with a configured endpoint, or use a loopback backend."
            }
            Self::AuthRejected { .. } => {
                "Verify the stored API key and endpoint with `cred-status`; re-store them if they have rotated."
            }
            Self::RateLimited { .. } => {
                "The backend is throttling requests. Retry later or reduce request volume."
            }
            Self::TimedOut { .. } => {
                "Increase the backend timeout, or check that the backend is reachable and responsive."
            }
            Self::InvalidResponse { .. } => {
                "The backend returned an unexpected body. Check backend logs and API version compatibility."
            }
            Self::Parse { .. } => {
                "The file could not be parsed; it is skipped. Inspect the file or install the required parser tooling."
            }
            Self::StoreCorruption(_) => {
                "The vector store metadata is unrecoverable. Re-index the source folder, or restore from a backup."
            }
            Self::Indexing(_) => {
                "Check free disk space and store permissions; the run can be resumed once resolved."
            }
            Self::Embedding(_) => {
                "Verify the embedding model files exist in the local model cache."
            }
            Self::Verification(_) => {
                "Verify the NLI model files exist in the local model cache, or disable the guard."
            }
            Self::Database(_) => "Check that the database file is writable and not locked by another process.",
            Self::Io(_) => "Check filesystem permissions and free space.",
            Self::Json(_) => "The record is malformed; inspect the referenced file.",
            Self::Http(_) => "Check network reachability of the configured backend.",
            Self::Internal(_) => "This is a bug; please report it with the surrounding log output.",
            Self::WithContext { .. } => unreachable!("kind() unwraps context"),
        }
    }

    /// True for kinds the router may retry with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            Self::TimedOut { .. } | Self::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_and_unwraps() {
        let err = Error::config("missing paths section")
            .with_context("file", "hybridrag.toml")
            .with_context("section", "paths");

        assert_eq!(err.code(), "config_error");
        let ctx = err.context().unwrap();
        assert_eq!(ctx.get("file").unwrap(), "hybridrag.toml");
        assert_eq!(ctx.get("section").unwrap(), "paths");
        assert!(matches!(err.kind(), Error::Config(_)));
    }

    #[test]
    fn retriable_kinds() {
        assert!(Error::TimedOut {
            backend: "local".into(),
            timeout_secs: 300
        }
        .is_retriable());
        assert!(Error::RateLimited {
            backend: "remote".into(),
            message: "429".into()
        }
        .is_retriable());
        assert!(!Error::AuthRejected {
            backend: "remote".into(),
            status: 401
        }
        .is_retriable());
        assert!(!Error::InvalidResponse {
            backend: "remote".into(),
            message: "empty choices".into()
        }
        .is_retriable());
    }

    #[test]
    fn remediation_never_empty() {
        let samples = vec![
            Error::config("x"),
            Error::credential("x"),
            Error::StoreCorruption("x".into()),
            Error::internal("x"),
        ];
        for err in samples {
            assert!(!err.remediation().is_empty());
        }
    }
}
