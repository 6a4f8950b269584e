//! LLM routing with gate enforcement, retries and backoff
//!
//! Every call checks the network gate first, then retries only the error
//! kinds that are safe to retry (timeouts and rate limits) with exponential
//! backoff and jitter. Authentication and malformed-response failures
//! surface immediately.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::security::NetworkGate;
use crate::types::LlmResponse;

use super::LlmBackend;

/// Which backend handles a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Local,
    Remote,
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Router over the configured backends
pub struct LlmRouter {
    gate: Arc<NetworkGate>,
    local: Option<Arc<dyn LlmBackend>>,
    remote: Option<Arc<dyn LlmBackend>>,
    max_retries: u32,
    backoff_base: Duration,
}

impl LlmRouter {
    pub fn new(
        gate: Arc<NetworkGate>,
        local: Option<Arc<dyn LlmBackend>>,
        remote: Option<Arc<dyn LlmBackend>>,
    ) -> Self {
        Self {
            gate,
            local,
            remote,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }

    /// Override the retry budget (tests, aggressive callers)
    pub fn with_retry_policy(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self
    }

    /// True when the given mode has a configured backend
    pub fn has_backend(&self, mode: RouteMode) -> bool {
        match mode {
            RouteMode::Local => self.local.is_some(),
            RouteMode::Remote => self.remote.is_some(),
        }
    }

    /// Submit a prompt to the backend selected by `mode`.
    ///
    /// The gate is consulted before every attempt; a denial is fatal and is
    /// never retried. `retry_count` on the response records how many
    /// attempts failed before the one that succeeded.
    pub async fn generate(&self, prompt: &str, mode: RouteMode) -> Result<LlmResponse> {
        let backend = self.backend_for(mode)?;
        let url = backend.endpoint_url();

        let mut attempt = 0u32;
        loop {
            self.gate
                .check_allowed(&url, "llm_generate", backend.name())?;

            match backend.generate(prompt).await {
                Ok(mut response) => {
                    response.retry_count = attempt;
                    tracing::debug!(
                        backend = backend.name(),
                        latency_ms = response.latency_ms,
                        retries = attempt,
                        "generation complete"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        backend = backend.name(),
                        attempt,
                        "retriable failure ({}), backing off {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Probe a backend without generating
    pub async fn probe(&self, mode: RouteMode) -> Result<bool> {
        let backend = self.backend_for(mode)?;
        let url = backend.endpoint_url();
        if !self.gate.is_allowed(&url) {
            return Ok(false);
        }
        backend.health_check().await
    }

    fn backend_for(&self, mode: RouteMode) -> Result<&Arc<dyn LlmBackend>> {
        let backend = match mode {
            RouteMode::Local => self.local.as_ref(),
            RouteMode::Remote => self.remote.as_ref(),
        };
        backend.ok_or_else(|| {
            Error::config(format!("No {} backend is configured for this mode", mode))
        })
    }

    /// Exponential backoff with jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base * 2u32.pow(attempt.min(8));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateMode;
    use crate::security::{AuditDecision, AuditLog};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that fails a configurable number of times before succeeding
    struct FlakyBackend {
        failures: AtomicU32,
        error: fn() -> Error,
        url: String,
    }

    #[async_trait]
    impl LlmBackend for FlakyBackend {
        async fn generate(&self, _prompt: &str) -> Result<LlmResponse> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(LlmResponse {
                answer_text: "ok".to_string(),
                tokens_in: 10,
                tokens_out: 2,
                latency_ms: 5,
                retry_count: 0,
            })
        }

        fn endpoint_url(&self) -> String {
            self.url.clone()
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn gate() -> Arc<NetworkGate> {
        Arc::new(NetworkGate::new(Arc::new(AuditLog::new())))
    }

    fn timed_out() -> Error {
        Error::TimedOut {
            backend: "flaky".to_string(),
            timeout_secs: 1,
        }
    }

    fn auth_rejected() -> Error {
        Error::AuthRejected {
            backend: "flaky".to_string(),
            status: 401,
        }
    }

    fn router_with(backend: FlakyBackend, gate: Arc<NetworkGate>) -> LlmRouter {
        LlmRouter::new(gate, Some(Arc::new(backend)), None)
            .with_retry_policy(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_timeouts_and_reports_count() {
        let backend = FlakyBackend {
            failures: AtomicU32::new(2),
            error: timed_out,
            url: "http://127.0.0.1:9999/api/generate".to_string(),
        };
        let router = router_with(backend, gate());

        let response = router.generate("q", RouteMode::Local).await.unwrap();
        assert_eq!(response.retry_count, 2);
        assert_eq!(response.answer_text, "ok");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let backend = FlakyBackend {
            failures: AtomicU32::new(10),
            error: timed_out,
            url: "http://127.0.0.1:9999/api/generate".to_string(),
        };
        let router = router_with(backend, gate());

        let err = router.generate("q", RouteMode::Local).await.unwrap_err();
        assert_eq!(err.code(), "timed_out");
    }

    #[tokio::test]
    async fn auth_rejection_is_never_retried() {
        let backend = FlakyBackend {
            failures: AtomicU32::new(1),
            error: auth_rejected,
            url: "http://127.0.0.1:9999/api/generate".to_string(),
        };
        let router = router_with(backend, gate());

        let err = router.generate("q", RouteMode::Local).await.unwrap_err();
        assert_eq!(err.code(), "auth_rejected");
        // One failure remains un-consumed proves there was no second attempt.
    }

    #[tokio::test]
    async fn offline_gate_blocks_remote_backend_before_any_socket() {
        let audit = Arc::new(AuditLog::new());
        let gate = Arc::new(NetworkGate::new(Arc::clone(&audit)));
        gate.configure(GateMode::Offline, &[]);

        let backend = FlakyBackend {
            failures: AtomicU32::new(0),
            error: timed_out,
            url: "https://api.example.com/v1/chat".to_string(),
        };
        let router = LlmRouter::new(gate, None, Some(Arc::new(backend)));

        let err = router.generate("q", RouteMode::Remote).await.unwrap_err();
        assert_eq!(err.code(), "network_blocked");
        assert_eq!(audit.count(AuditDecision::Deny), 1);
    }

    #[tokio::test]
    async fn missing_backend_is_a_config_error() {
        let router = LlmRouter::new(gate(), None, None);
        let err = router.generate("q", RouteMode::Local).await.unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}
