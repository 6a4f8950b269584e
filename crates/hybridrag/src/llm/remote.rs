//! Remote API backend
//!
//! Chat-completions style client authenticated with the resolved API key.
//! The key never appears in logs; diagnostics use the masked form.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::RemoteApiConfig;
use crate::error::{Error, Result};
use crate::security::{mask_secret, CredentialBundle};
use crate::types::LlmResponse;

use super::LlmBackend;

/// Deployment names preferred by auto-selection, best first
const DEPLOYMENT_PRIORITY: &[&str] = &["prod", "stable", "default", "base"];

/// Deployments never auto-selected (preview and evaluation targets)
const BANNED_DEPLOYMENTS: &[&str] = &["canary", "preview", "experimental"];

/// Client for the remote chat-completions API
pub struct RemoteApiClient {
    client: Client,
    endpoint: String,
    api_key: String,
    deployment: Option<String>,
    api_version: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
    timeout_seconds: u64,
    /// Deployment list cached for the process lifetime
    deployments: OnceLock<Vec<String>>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct DeploymentList {
    #[serde(default)]
    data: Vec<DeploymentEntry>,
}

#[derive(Deserialize)]
struct DeploymentEntry {
    id: String,
}

impl RemoteApiClient {
    /// Build the client from configuration plus the resolved credentials
    pub fn new(config: &RemoteApiConfig, credentials: &CredentialBundle) -> Result<Self> {
        let endpoint = credentials
            .endpoint
            .clone()
            .ok_or_else(|| Error::credential("No remote endpoint available"))?;
        let api_key = credentials
            .api_key
            .clone()
            .ok_or_else(|| Error::credential("No API key available"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(
            endpoint = %endpoint,
            key = %mask_secret(&api_key),
            "remote API client configured"
        );

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            deployment: credentials.deployment.clone().filter(|d| !d.is_empty()),
            api_version: credentials
                .api_version
                .clone()
                .unwrap_or_else(|| config.api_version.clone()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_seconds: config.timeout_seconds,
            deployments: OnceLock::new(),
        })
    }

    /// List available deployments, cached for the process lifetime
    pub async fn list_deployments(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.deployments.get() {
            return Ok(cached.clone());
        }

        let url = compose_url(&self.endpoint, "openai/deployments")?;
        let url = format!("{}?api-version={}", url, self.api_version);
        let response = self
            .client
            .get(&url)
            .header("api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;
        let response = self.check_status(response).await?;

        let list: DeploymentList = response.json().await.map_err(|e| Error::InvalidResponse {
            backend: "remote".to_string(),
            message: format!("unparseable deployment list: {}", e),
        })?;

        let names: Vec<String> = list.data.into_iter().map(|d| d.id).collect();
        let _ = self.deployments.set(names.clone());
        Ok(names)
    }

    /// Deployment used for the next call: the configured one, or the best
    /// auto-selected candidate from the cached deployment list.
    pub async fn active_deployment(&self) -> Result<String> {
        if let Some(deployment) = &self.deployment {
            return Ok(deployment.clone());
        }
        let available = self.list_deployments().await?;
        auto_select_deployment(&available).ok_or_else(|| {
            Error::config("No deployment configured and none of the available deployments is selectable")
        })
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(Error::AuthRejected {
                backend: "remote".to_string(),
                status: status.as_u16(),
            }),
            429 => {
                let hint = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| format!("retry-after {}", v))
                    .unwrap_or_else(|| "rate limit".to_string());
                Err(Error::RateLimited {
                    backend: "remote".to_string(),
                    message: hint,
                })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::InvalidResponse {
                    backend: "remote".to_string(),
                    message: format!("HTTP {} - {}", status, body.chars().take(200).collect::<String>()),
                })
            }
        }
    }

    fn map_request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::TimedOut {
                backend: "remote".to_string(),
                timeout_secs: self.timeout_seconds,
            }
        } else {
            Error::Http(e)
        }
    }
}

#[async_trait]
impl LlmBackend for RemoteApiClient {
    async fn generate(&self, prompt: &str) -> Result<LlmResponse> {
        let deployment = self.active_deployment().await?;
        let path = format!("openai/deployments/{}/chat/completions", deployment);
        let url = compose_url(&self.endpoint, &path)?;
        let url = format!("{}?api-version={}", url, self.api_version);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;
        let response = self.check_status(response).await?;

        let body: ChatResponse = response.json().await.map_err(|e| Error::InvalidResponse {
            backend: "remote".to_string(),
            message: format!("unparseable body: {}", e),
        })?;

        let answer = body
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        if answer.is_empty() {
            return Err(Error::InvalidResponse {
                backend: "remote".to_string(),
                message: "empty choices".to_string(),
            });
        }

        let usage = body.usage.unwrap_or(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        Ok(LlmResponse {
            answer_text: answer,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
            retry_count: 0,
        })
    }

    fn endpoint_url(&self) -> String {
        self.endpoint.clone()
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.list_deployments().await.is_ok())
    }

    fn name(&self) -> &str {
        "remote"
    }
}

/// Join an endpoint and a path, rejecting double-appended segments.
///
/// If the endpoint already ends with the first segment of `path` (for
/// example an endpoint configured as `…/openai` joined with an
/// `openai/deployments/…` path), the composition would hit a nonsense URL;
/// catching it here turns a confusing 404 into a configuration diagnostic.
pub fn compose_url(endpoint: &str, path: &str) -> Result<String> {
    let endpoint = endpoint.trim_end_matches('/');
    let path = path.trim_start_matches('/');

    let last_segment = endpoint.rsplit('/').next().unwrap_or("");
    let first_segment = path.split('/').next().unwrap_or("");
    if !last_segment.is_empty()
        && !last_segment.contains('.')
        && last_segment.eq_ignore_ascii_case(first_segment)
    {
        return Err(Error::config(format!(
            "Endpoint '{}' already ends with '/{}'; refusing to append '{}' again",
            endpoint, last_segment, first_segment
        )));
    }

    Ok(format!("{}/{}", endpoint, path))
}

/// Pick a deployment from the priority list, skipping the banned set
fn auto_select_deployment(available: &[String]) -> Option<String> {
    let allowed: Vec<&String> = available
        .iter()
        .filter(|d| !BANNED_DEPLOYMENTS.iter().any(|b| d.eq_ignore_ascii_case(b)))
        .collect();

    for preferred in DEPLOYMENT_PRIORITY {
        if let Some(found) = allowed
            .iter()
            .find(|d| d.eq_ignore_ascii_case(preferred))
        {
            return Some((*found).clone());
        }
    }
    allowed.first().map(|d| (*d).clone())
}
