//! Local inference backend
//!
//! Talks to an Ollama-compatible server on a loopback address. Local CPU
//! inference is slow, so the timeout is generous (default 300 s).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LocalBackendConfig;
use crate::error::{Error, Result};
use crate::types::LlmResponse;

use super::LlmBackend;

/// Client for the local inference server
pub struct LocalInferenceClient {
    client: Client,
    config: LocalBackendConfig,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_ctx: usize,
    num_predict: usize,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl LocalInferenceClient {
    pub fn new(config: &LocalBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn map_request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::TimedOut {
                backend: "local".to_string(),
                timeout_secs: self.config.timeout_seconds,
            }
        } else {
            Error::Http(e)
        }
    }
}

#[async_trait]
impl LlmBackend for LocalInferenceClient {
    async fn generate(&self, prompt: &str) -> Result<LlmResponse> {
        let url = self.endpoint_url();
        let request = GenerateRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_ctx: self.config.context_window,
                num_predict: self.config.max_tokens,
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited {
                backend: "local".to_string(),
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidResponse {
                backend: "local".to_string(),
                message: format!("HTTP {} - {}", status, truncate(&body, 200)),
            });
        }

        let body: GenerateResponse = response.json().await.map_err(|e| Error::InvalidResponse {
            backend: "local".to_string(),
            message: format!("unparseable body: {}", e),
        })?;

        if body.response.is_empty() {
            return Err(Error::InvalidResponse {
                backend: "local".to_string(),
                message: "empty generation".to_string(),
            });
        }

        Ok(LlmResponse {
            answer_text: body.response,
            tokens_in: body.prompt_eval_count.unwrap_or(0),
            tokens_out: body.eval_count.unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
            retry_count: 0,
        })
    }

    fn endpoint_url(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.config.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while end < s.len() && !s.is_char_boundary(end) {
        end += 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn config(base_url: String) -> LocalBackendConfig {
        LocalBackendConfig {
            base_url,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn generate_parses_answer_and_token_counts() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200).json_body(serde_json::json!({
                "response": "The MUF is 14 MHz.",
                "prompt_eval_count": 120,
                "eval_count": 9
            }));
        });

        let client = LocalInferenceClient::new(&config(server.base_url())).unwrap();
        let out = client.generate("question").await.unwrap();

        mock.assert();
        assert_eq!(out.answer_text, "The MUF is 14 MHz.");
        assert_eq!(out.tokens_in, 120);
        assert_eq!(out.tokens_out, 9);
    }

    #[tokio::test]
    async fn empty_generation_maps_to_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200).json_body(serde_json::json!({ "response": "" }));
        });

        let client = LocalInferenceClient::new(&config(server.base_url())).unwrap();
        let err = client.generate("question").await.unwrap_err();
        assert_eq!(err.code(), "invalid_response");
    }

    #[tokio::test]
    async fn http_error_body_is_surfaced() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(500).body("model not loaded");
        });

        let client = LocalInferenceClient::new(&config(server.base_url())).unwrap();
        let err = client.generate("question").await.unwrap_err();
        assert_eq!(err.code(), "invalid_response");
        assert!(err.to_string().contains("model not loaded"));
    }

    #[tokio::test]
    async fn health_check_false_when_unreachable() {
        let client =
            LocalInferenceClient::new(&config("http://127.0.0.1:1".to_string())).unwrap();
        assert!(!client.health_check().await.unwrap());
    }
}
