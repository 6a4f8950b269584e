//! Configuration for the engine
//!
//! A single nested structure deserialized from TOML. Unknown top-level keys
//! are rejected at load time; per-section validation happens in the boot
//! pipeline so that every problem surfaces with a remediation hint.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RagConfig {
    /// Storage and source paths
    #[serde(default)]
    pub paths: PathsConfig,
    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Local inference backend
    #[serde(default)]
    pub local_backend: LocalBackendConfig,
    /// Remote API backend
    #[serde(default)]
    pub remote_api: RemoteApiConfig,
    /// Security / network gate configuration
    #[serde(default)]
    pub security: SecurityConfig,
    /// Hallucination guard configuration
    #[serde(default)]
    pub guard: GuardConfig,
    /// Cost tracking configuration
    #[serde(default)]
    pub cost: CostConfig,
}

impl RagConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Cannot read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&text)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("Invalid config: {}", e)))
    }
}

/// Storage and source paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Relational database file
    pub database_file: PathBuf,
    /// Memory-mapped vector matrix file
    pub vector_matrix_file: PathBuf,
    /// Sidecar metadata file for the matrix
    pub vector_meta_file: PathBuf,
    /// Folder scanned by the indexer
    pub source_folder: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hybridrag");
        Self {
            database_file: data_dir.join("chunks.db"),
            vector_matrix_file: data_dir.join("vectors.bin"),
            vector_meta_file: data_dir.join("vectors_meta.json"),
            source_folder: PathBuf::from("./documents"),
        }
    }
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Model name, resolved inside the local cache directory
    pub model_name: String,
    /// Expected dimension; 0 means auto-detect from the model at load time
    #[serde(default)]
    pub dimension: usize,
    /// Batch size for indexing-time embedding
    pub batch_size: usize,
    /// Inference device hint ("cpu" or "cuda")
    pub device: String,
    /// Local cache directory holding model.onnx and tokenizer.json
    pub cache_dir: PathBuf,
    /// Maximum token sequence length
    pub max_length: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: "all-MiniLM-L6-v2".to_string(),
            dimension: 0,
            batch_size: 32,
            device: "cpu".to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hybridrag")
                .join("models"),
            max_length: 256,
        }
    }
}

/// Text chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters
    pub overlap: usize,
    /// Maximum heading length preserved by the heading prepend
    pub max_heading_len: usize,
    /// Backward scan distance when looking for the nearest heading
    pub heading_scan_chars: usize,
    /// Character count per processing block during indexing
    pub block_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1200,
            overlap: 200,
            max_heading_len: 120,
            heading_scan_chars: 2000,
            block_chars: 200_000,
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    /// Number of chunks returned to the caller
    pub top_k: usize,
    /// Minimum normalized score; lower-scoring chunks are dropped
    pub min_score: f32,
    /// Combine vector and keyword search with RRF
    pub hybrid_search: bool,
    /// RRF rank constant
    pub rrf_k: u32,
    /// Enable the cross-encoder reranker (opt-in; narrows context diversity)
    pub reranker_enabled: bool,
    /// Candidate pool size for keyword search and reranking
    pub reranker_top_n: usize,
    /// Rows per block during the matrix scan
    pub scan_block_rows: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.25,
            hybrid_search: true,
            rrf_k: 60,
            reranker_enabled: false,
            reranker_top_n: 20,
            scan_block_rows: 1024,
        }
    }
}

/// Local inference backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalBackendConfig {
    /// Base URL of the local inference server (must be loopback)
    pub base_url: String,
    /// Generation model name
    pub model: String,
    /// Request timeout; local CPU inference is slow
    pub timeout_seconds: u64,
    /// Context window passed to the backend
    pub context_window: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum generated tokens
    pub max_tokens: usize,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "phi3".to_string(),
            timeout_seconds: 300,
            context_window: 4096,
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

/// Remote API backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteApiConfig {
    /// API endpoint; empty means not configured
    #[serde(default)]
    pub endpoint: String,
    /// Model name
    #[serde(default)]
    pub model: String,
    /// Deployment name; empty triggers auto-selection
    #[serde(default)]
    pub deployment: String,
    /// API version query parameter
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Maximum generated tokens
    #[serde(default = "default_remote_max_tokens")]
    pub max_tokens: usize,
    /// Sampling temperature
    #[serde(default = "default_remote_temperature")]
    pub temperature: f32,
    /// Request timeout
    #[serde(default = "default_remote_timeout")]
    pub timeout_seconds: u64,
    /// API key; discouraged — prefer the keystore or environment
    #[serde(default)]
    pub api_key: String,
}

fn default_api_version() -> String {
    "2024-06-01".to_string()
}
fn default_remote_max_tokens() -> usize {
    1024
}
fn default_remote_temperature() -> f32 {
    0.2
}
fn default_remote_timeout() -> u64 {
    30
}

impl Default for RemoteApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: String::new(),
            deployment: String::new(),
            api_version: default_api_version(),
            max_tokens: default_remote_max_tokens(),
            temperature: default_remote_temperature(),
            timeout_seconds: default_remote_timeout(),
            api_key: String::new(),
        }
    }
}

/// Gate mode requested by configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Loopback hosts only
    #[default]
    Offline,
    /// Loopback plus the configured endpoints
    Online,
    /// Unrestricted; every call still audited
    Admin,
}

impl std::fmt::Display for GateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Requested gate mode
    pub mode: GateMode,
    /// Persist network audit records to a JSONL file
    pub audit_logging: bool,
    /// Strip likely PII from prompts before sending to remote backends
    pub pii_sanitization: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: GateMode::Offline,
            audit_logging: true,
            pii_sanitization: false,
        }
    }
}

/// Action when a response fails verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardFailureAction {
    /// Keep the answer, flag it unsafe
    #[default]
    Warn,
    /// Replace the answer with the safe rewrite
    Block,
}

/// Hallucination guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Enable the guard for online responses
    pub enabled: bool,
    /// Minimum supported-claim ratio; must be finite and within [0, 1]
    pub faithfulness_threshold: f32,
    /// What to do when verification fails
    pub failure_action: GuardFailureAction,
    /// Verify each claim against at most this many chunks
    pub chunk_prune_k: usize,
    /// Consecutive supported claims before the remainder is assumed supported
    pub short_circuit_pass_count: usize,
    /// Contradictions before the whole response is marked unsafe
    pub short_circuit_fail_count: usize,
    /// Local cache directory for the NLI model
    pub nli_cache_dir: PathBuf,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            faithfulness_threshold: 0.7,
            failure_action: GuardFailureAction::Block,
            chunk_prune_k: 4,
            short_circuit_pass_count: 5,
            short_circuit_fail_count: 2,
            nli_cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hybridrag")
                .join("nli"),
        }
    }
}

/// Cost tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostConfig {
    /// Record per-call cost estimates
    pub enabled: bool,
    /// USD per 1K prompt tokens
    pub input_per_1k: f64,
    /// USD per 1K completion tokens
    pub output_per_1k: f64,
    /// Append-only cost log file; empty disables the file sink
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_per_1k: 0.005,
            output_per_1k: 0.015,
            log_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = RagConfig::default();
        assert_eq!(config.chunking.chunk_size, 1200);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.security.mode, GateMode::Offline);
        assert!(!config.retrieval.reranker_enabled);
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let toml = r#"
            [chunking]
            chunk_size = 800

            [telemetry]
            enabled = true
        "#;
        let err = RagConfig::from_toml(toml).unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml = r#"
            [retrieval]
            top_k = 8
        "#;
        let config = RagConfig::from_toml(toml).unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.local_backend.timeout_seconds, 300);
    }

    #[test]
    fn gate_mode_parses_lowercase() {
        let toml = r#"
            [security]
            mode = "online"
            audit_logging = true
            pii_sanitization = false
        "#;
        let config = RagConfig::from_toml(toml).unwrap();
        assert_eq!(config.security.mode, GateMode::Online);
    }
}
