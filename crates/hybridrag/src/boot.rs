//! Boot pipeline: configuration, credentials, gate and backend readiness
//!
//! The pipeline never crashes on missing optional credentials; it marks the
//! corresponding mode unavailable and continues. Offline mode succeeds
//! whenever the local backend is reachable, regardless of how broken the
//! remote configuration is.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::Url;

use crate::config::{GateMode, RagConfig};
use crate::error::{Error, Result};
use crate::llm::{LlmBackend, LlmRouter, LocalInferenceClient, RemoteApiClient, RouteMode};
use crate::security::{AuditLog, CredentialBundle, CredentialResolver, NetworkGate};

/// Readiness report plus the constructed runtime components.
///
/// This is the resource scope for everything boot creates; `shutdown()`
/// releases it on every exit path.
pub struct BootResult {
    pub success: bool,
    pub online_available: bool,
    pub offline_available: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub booted_at: DateTime<Utc>,
    /// Effective gate mode after reconciling config with credentials
    pub effective_mode: GateMode,
    pub gate: Arc<NetworkGate>,
    pub audit: Arc<AuditLog>,
    pub router: Arc<LlmRouter>,
    pub credentials: CredentialBundle,
}

impl BootResult {
    /// Route mode the engine should use
    pub fn route_mode(&self) -> RouteMode {
        if self.online_available && self.effective_mode != GateMode::Offline {
            RouteMode::Remote
        } else {
            RouteMode::Local
        }
    }

    /// Human-readable readiness summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("booted at {}", self.booted_at.to_rfc3339()),
            format!("success: {}", self.success),
            format!("mode: {}", self.effective_mode),
            format!("online available: {}", self.online_available),
            format!("offline available: {}", self.offline_available),
        ];
        for w in &self.warnings {
            lines.push(format!("warning: {}", w));
        }
        for e in &self.errors {
            lines.push(format!("error: {}", e));
        }
        lines.join("\n")
    }

    /// Release boot-owned resources; idempotent
    pub fn shutdown(&self) {
        tracing::info!("boot scope shut down");
    }
}

/// Composes configuration and backend readiness into one fallible sequence
pub struct BootPipeline {
    config: RagConfig,
    use_keystore: bool,
}

impl BootPipeline {
    pub fn new(config: RagConfig) -> Self {
        Self {
            config,
            use_keystore: true,
        }
    }

    /// Skip the OS keystore (headless CI, tests)
    pub fn without_keystore(mut self) -> Self {
        self.use_keystore = false;
        self
    }

    /// Run the boot sequence
    pub async fn run(mut self) -> Result<BootResult> {
        let booted_at = Utc::now();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        // Model lookups must resolve against the local cache only; these
        // flags stop the model libraries from reaching hub endpoints.
        std::env::set_var("HF_HUB_OFFLINE", "1");
        std::env::set_var("TRANSFORMERS_OFFLINE", "1");

        self.validate_config(&mut warnings, &mut errors);

        let resolver = if self.use_keystore {
            CredentialResolver::new(self.config.remote_api.clone())
        } else {
            CredentialResolver::without_keystore(self.config.remote_api.clone())
        };
        let (credentials, provenance) = resolver.resolve();
        for (field, source) in &provenance {
            tracing::debug!(field = %field, source = ?source, "credential resolved");
        }

        // Joint validation: requested mode versus what credentials allow.
        let requested = self.config.security.mode;
        let effective_mode = match requested {
            GateMode::Online if !credentials.is_complete() => {
                warnings.push(
                    "online mode requested but no complete credential bundle; staying offline"
                        .to_string(),
                );
                GateMode::Offline
            }
            other => other,
        };

        let audit = if self.config.security.audit_logging {
            let sink = self
                .config
                .paths
                .database_file
                .with_file_name("network_audit.jsonl");
            Arc::new(AuditLog::with_sink(sink))
        } else {
            Arc::new(AuditLog::new())
        };
        let gate = Arc::new(NetworkGate::new(Arc::clone(&audit)));

        let allowed: Vec<String> = match effective_mode {
            GateMode::Online => credentials.endpoint.iter().cloned().collect(),
            _ => Vec::new(),
        };
        gate.configure(effective_mode, &allowed);

        if !errors.is_empty() {
            let router = Arc::new(LlmRouter::new(Arc::clone(&gate), None, None));
            return Ok(BootResult {
                success: false,
                online_available: false,
                offline_available: false,
                warnings,
                errors,
                booted_at,
                effective_mode,
                gate,
                audit,
                router,
                credentials,
            });
        }

        // Build the backends, then probe through the router so every boot
        // probe passes the gate and lands in the audit log.
        let local: Option<Arc<dyn LlmBackend>> =
            match LocalInferenceClient::new(&self.config.local_backend) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warnings.push(format!("local backend unavailable: {}", e));
                    None
                }
            };

        let mut online_available = false;
        let remote: Option<Arc<dyn LlmBackend>> = if effective_mode != GateMode::Offline
            && credentials.is_complete()
        {
            match RemoteApiClient::new(&self.config.remote_api, &credentials) {
                Ok(client) => {
                    online_available = true;
                    Some(Arc::new(client))
                }
                Err(e) => {
                    warnings.push(format!("remote backend unavailable: {}", e));
                    None
                }
            }
        } else {
            None
        };

        let router = Arc::new(LlmRouter::new(Arc::clone(&gate), local, remote));

        let mut offline_available = false;
        if router.has_backend(RouteMode::Local) {
            match router.probe(RouteMode::Local).await {
                Ok(true) => offline_available = true,
                Ok(false) => warnings.push(format!(
                    "local inference server at {} is not responding",
                    self.config.local_backend.base_url
                )),
                Err(e) => warnings.push(format!("local backend probe failed: {}", e)),
            }
        }
        let success = online_available || offline_available;
        if !success {
            errors.push("no backend is available in any mode".to_string());
        }

        tracing::info!(
            success,
            online_available,
            offline_available,
            mode = %effective_mode,
            "boot pipeline finished"
        );

        Ok(BootResult {
            success,
            online_available,
            offline_available,
            warnings,
            errors,
            booted_at,
            effective_mode,
            gate,
            audit,
            router,
            credentials,
        })
    }

    /// Section-by-section validation. Hard errors fail the boot; malformed
    /// URLs are cleared with a warning.
    fn validate_config(&mut self, warnings: &mut Vec<String>, errors: &mut Vec<String>) {
        let config = &mut self.config;

        // paths
        for (name, path) in [
            ("paths.database_file", &config.paths.database_file),
            ("paths.vector_matrix_file", &config.paths.vector_matrix_file),
            ("paths.vector_meta_file", &config.paths.vector_meta_file),
        ] {
            if path.as_os_str().is_empty() {
                errors.push(format!("{} must not be empty", name));
            }
        }

        // chunking
        if config.chunking.chunk_size == 0 {
            errors.push("chunking.chunk_size must be positive".to_string());
        }
        if config.chunking.overlap >= config.chunking.chunk_size.max(1) {
            errors.push("chunking.overlap must be smaller than chunking.chunk_size".to_string());
        }

        // retrieval
        if config.retrieval.top_k == 0 {
            errors.push("retrieval.top_k must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&config.retrieval.min_score) {
            errors.push("retrieval.min_score must be within [0, 1]".to_string());
        }
        if config.retrieval.rrf_k == 0 {
            errors.push("retrieval.rrf_k must be positive".to_string());
        }

        // embedding
        if config.embedding.batch_size == 0 {
            errors.push("embedding.batch_size must be positive".to_string());
        }

        // guard: invalid thresholds fail the boot outright
        let threshold = config.guard.faithfulness_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            errors.push(format!(
                "guard.faithfulness_threshold must be a finite value in [0, 1], got {}",
                threshold
            ));
        }

        // backend URLs: malformed ones are cleared with a warning
        if Url::parse(&config.local_backend.base_url).is_err() {
            warnings.push(format!(
                "local_backend.base_url '{}' is malformed; cleared",
                config.local_backend.base_url
            ));
            config.local_backend.base_url = String::new();
        }
        if !config.remote_api.endpoint.is_empty()
            && Url::parse(&config.remote_api.endpoint).is_err()
        {
            warnings.push(format!(
                "remote_api.endpoint '{}' is malformed; cleared",
                config.remote_api.endpoint
            ));
            config.remote_api.endpoint = String::new();
        }
    }
}

/// Convenience: error for surfacing a failed boot to callers that need one
pub fn boot_failure(result: &BootResult) -> Error {
    Error::config(format!("boot failed: {}", result.errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn base_config() -> RagConfig {
        RagConfig::default()
    }

    #[tokio::test]
    async fn offline_boot_succeeds_when_local_server_responds() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(serde_json::json!({"models": []}));
        });

        let mut config = base_config();
        config.local_backend.base_url = server.base_url();
        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();

        assert!(result.success);
        assert!(result.offline_available);
        assert!(!result.online_available);
        assert_eq!(result.route_mode(), RouteMode::Local);
    }

    #[tokio::test]
    async fn invalid_guard_threshold_fails_boot() {
        let mut config = base_config();
        config.guard.faithfulness_threshold = 1.5;
        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();

        assert!(!result.success);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("faithfulness_threshold")));
    }

    #[tokio::test]
    async fn nan_guard_threshold_fails_boot() {
        let mut config = base_config();
        config.guard.faithfulness_threshold = f32::NAN;
        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn online_without_credentials_degrades_to_offline() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).body("{}");
        });

        let mut config = base_config();
        config.security.mode = GateMode::Online;
        config.local_backend.base_url = server.base_url();
        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();

        assert_eq!(result.effective_mode, GateMode::Offline);
        assert!(result.warnings.iter().any(|w| w.contains("staying offline")));
        assert!(result.success);
        assert!(result.offline_available);
    }

    #[tokio::test]
    async fn online_with_config_credentials_constructs_remote() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).body("{}");
        });

        let mut config = base_config();
        config.security.mode = GateMode::Online;
        config.local_backend.base_url = server.base_url();
        config.remote_api.endpoint = "https://api.example.com".to_string();
        config.remote_api.api_key = "sk-test-abcdef123456".to_string();

        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();
        assert!(result.success);
        assert!(result.online_available);
        assert_eq!(result.route_mode(), RouteMode::Remote);
        assert_eq!(result.effective_mode, GateMode::Online);
    }

    #[tokio::test]
    async fn malformed_urls_are_cleared_with_warnings() {
        let mut config = base_config();
        config.local_backend.base_url = "not a url".to_string();
        config.remote_api.endpoint = "also not a url".to_string();

        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("local_backend.base_url")));
        assert!(result.warnings.iter().any(|w| w.contains("remote_api.endpoint")));
        // Nothing reachable: boot reports failure rather than crashing.
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("no backend")));
    }

    #[tokio::test]
    async fn success_implies_some_mode_available() {
        let mut config = base_config();
        config.local_backend.base_url = "http://127.0.0.1:1".to_string();
        let result = BootPipeline::new(config).without_keystore().run().await.unwrap();
        if result.success {
            assert!(result.online_available || result.offline_available);
        }
        let _ = result.summary();
        result.shutdown();
    }
}
