//! LLM backends and the gated router

pub mod local;
pub mod remote;
pub mod router;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::LlmResponse;

pub use local::LocalInferenceClient;
pub use remote::RemoteApiClient;
pub use router::{LlmRouter, RouteMode};

/// A backend able to turn a prompt into a response
///
/// Implementations map their wire-level failures onto the shared error
/// taxonomy; the router never inspects backend-specific bodies.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Submit a prompt and return the structured response.
    /// `retry_count` is left at zero; the router fills it in.
    async fn generate(&self, prompt: &str) -> Result<LlmResponse>;

    /// URL the next call will hit, for gate checks and diagnostics
    fn endpoint_url(&self) -> String;

    /// Probe backend reachability without generating
    async fn health_check(&self) -> Result<bool>;

    /// Backend name for logging and error mapping
    fn name(&self) -> &str;
}
