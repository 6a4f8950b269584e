//! End-to-end query handling
//!
//! Every exit path returns a `QueryResult`; no error escapes to the caller.
//! The engine embeds the question, retrieves, assembles a hardened prompt,
//! calls the router, optionally verifies the response, and records cost.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{CostConfig, GuardFailureAction, RagConfig};
use crate::embedding::EmbeddingProvider;
use crate::guard::{HallucinationGuard, PromptHardener};
use crate::llm::{LlmRouter, RouteMode};
use crate::retrieval::Retriever;
use crate::types::{Hit, QueryResult, SourceRef};

/// One cost-log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Estimates per-call cost and appends records to the cost log
pub struct CostTracker {
    config: CostConfig,
    session_total: Mutex<f64>,
}

impl CostTracker {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            session_total: Mutex::new(0.0),
        }
    }

    /// Record a call; returns the estimated cost in USD
    pub fn record(&self, mode: RouteMode, tokens_in: u64, tokens_out: u64) -> f64 {
        if !self.config.enabled {
            return 0.0;
        }
        let cost = tokens_in as f64 / 1000.0 * self.config.input_per_1k
            + tokens_out as f64 / 1000.0 * self.config.output_per_1k;
        *self.session_total.lock() += cost;

        let record = CostRecord {
            timestamp: Utc::now(),
            mode: mode.to_string(),
            tokens_in,
            tokens_out,
            cost_usd: cost,
        };
        tracing::debug!(mode = %record.mode, cost_usd = cost, "cost recorded");

        if let Some(path) = &self.config.log_file {
            if let Ok(line) = serde_json::to_string(&record) {
                let appended = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut f| writeln!(f, "{}", line));
                if let Err(e) = appended {
                    tracing::warn!("failed to append cost record: {}", e);
                }
            }
        }
        cost
    }

    /// Total estimated spend this process
    pub fn session_total(&self) -> f64 {
        *self.session_total.lock()
    }
}

/// End-to-end query engine
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    retriever: Retriever,
    router: Arc<LlmRouter>,
    guard: Option<Arc<HallucinationGuard>>,
    cost: CostTracker,
    route_mode: RouteMode,
    top_k: usize,
    min_score: f32,
    failure_action: GuardFailureAction,
    pii_sanitization: bool,
}

impl QueryEngine {
    pub fn new(
        config: &RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        retriever: Retriever,
        router: Arc<LlmRouter>,
        route_mode: RouteMode,
    ) -> Self {
        Self {
            embedder,
            retriever,
            router,
            guard: None,
            cost: CostTracker::new(config.cost.clone()),
            route_mode,
            top_k: config.retrieval.top_k,
            min_score: config.retrieval.min_score,
            failure_action: config.guard.failure_action,
            pii_sanitization: config.security.pii_sanitization,
        }
    }

    /// Attach the hallucination guard (applied to online responses)
    pub fn with_guard(mut self, guard: Arc<HallucinationGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// The cost tracker, for status surfaces
    pub fn cost(&self) -> &CostTracker {
        &self.cost
    }

    /// Answer a question. Never returns an error: failures come back inside
    /// the `QueryResult` with the retrieval context that was available.
    pub async fn answer(&self, question: &str) -> QueryResult {
        let started = Instant::now();

        let query_vector = match self.embedder.embed_one(question).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("query embedding failed: {}", e);
                return QueryResult::from_failure(&e, Vec::new(), elapsed_ms(started));
            }
        };

        let hits = match self.retriever.search(
            question,
            &query_vector,
            self.top_k,
            self.min_score,
            self.retriever.default_mode(),
        ) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!("retrieval failed: {}", e);
                return QueryResult::from_failure(&e, Vec::new(), elapsed_ms(started));
            }
        };

        if hits.is_empty() {
            tracing::info!("no chunks above min_score; skipping the LLM");
            return QueryResult::no_documents(elapsed_ms(started));
        }
        let sources: Vec<SourceRef> = hits.iter().map(SourceRef::from_hit).collect();

        let mut prompt = PromptHardener::build_prompt(question, &hits);
        if self.pii_sanitization && self.route_mode == RouteMode::Remote {
            prompt = crate::security::sanitize_pii(&prompt);
        }
        let response = match self.router.generate(&prompt, self.route_mode).await {
            Ok(response) => response,
            Err(e) => {
                // Timeouts and gate denials surface with the retrieval
                // result attached; there is no partial-success ambiguity.
                tracing::warn!("generation failed: {}", e);
                return QueryResult::from_failure(&e, sources, elapsed_ms(started));
            }
        };

        let (answer_text, is_safe) = match self.verify_if_online(&response.answer_text, &hits).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Verification infrastructure failure fails closed: the
                // unverified answer is withheld.
                tracing::error!("guard failed: {}", e);
                return QueryResult::from_failure(&e, sources, elapsed_ms(started));
            }
        };

        let cost = self
            .cost
            .record(self.route_mode, response.tokens_in, response.tokens_out);
        tracing::info!(
            mode = %self.route_mode,
            tokens_in = response.tokens_in,
            tokens_out = response.tokens_out,
            cost_usd = cost,
            is_safe,
            "query answered"
        );

        QueryResult {
            answer_text,
            sources,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            latency_ms: elapsed_ms(started),
            is_safe,
            error: None,
        }
    }

    /// Apply the guard to online responses; offline responses pass through
    async fn verify_if_online(
        &self,
        answer: &str,
        hits: &[Hit],
    ) -> crate::error::Result<(String, bool)> {
        let Some(guard) = &self.guard else {
            return Ok((answer.to_string(), true));
        };
        if self.route_mode != RouteMode::Remote || !guard.enabled() {
            return Ok((answer.to_string(), true));
        }

        let report = guard.verify(answer, hits).await?;
        if report.is_safe {
            return Ok((answer.to_string(), true));
        }

        let text = match (self.failure_action, report.safe_response) {
            (GuardFailureAction::Block, Some(rewrite)) => rewrite,
            // Warn keeps the answer but flags it.
            _ => answer.to_string(),
        };
        Ok((text, false))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
