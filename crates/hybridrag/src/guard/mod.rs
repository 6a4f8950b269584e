//! Hallucination guard: claim-level verification of LLM responses
//!
//! Five layers: prompt hardening, claim extraction, NLI verification,
//! response scoring, and safe-response construction. The unsafe decision and
//! the safe rewrite are driven by one shared predicate — they can never
//! disagree about whether a response failed verification.

pub mod claims;
pub mod hardener;
pub mod nli;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::GuardConfig;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::types::Hit;

pub use claims::ClaimExtractor;
pub use hardener::{PromptHardener, EXACT_LINE_PREFIX, REFUSAL_PHRASE};
pub use nli::{ClaimVerdict, NliProvider, NliScores, OnnxNli};

/// Entailment probability at or above which a claim counts as supported
const ENTAILMENT_THRESHOLD: f32 = 0.6;

/// Contradiction probability at or above which a claim counts as contradicted
const CONTRADICTION_THRESHOLD: f32 = 0.6;

/// One claim with its verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimAssessment {
    pub claim: String,
    pub verdict: ClaimVerdict,
}

/// Outcome of verifying one response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// False when the shared failure predicate fired
    pub is_safe: bool,
    /// supported / total claims, in [0, 1]
    pub faithfulness: f32,
    pub assessments: Vec<ClaimAssessment>,
    /// Contradicted or unverified claims, in response order
    pub flagged: Vec<String>,
    /// Present exactly when `is_safe` is false; never byte-identical to the
    /// original response
    pub safe_response: Option<String>,
}

/// Claim-level response verifier
pub struct HallucinationGuard {
    config: GuardConfig,
    nli: Arc<dyn NliProvider>,
    /// Used to prune chunks per claim; optional, falls back to rank order
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    extractor: ClaimExtractor,
}

impl HallucinationGuard {
    pub fn new(config: GuardConfig, nli: Arc<dyn NliProvider>) -> Self {
        Self {
            config,
            nli,
            embedder: None,
            extractor: ClaimExtractor::new(),
        }
    }

    /// Guard backed by the local ONNX cross-encoder from the configured
    /// cache directory. The model loads lazily on first verification.
    pub fn local(config: GuardConfig) -> Self {
        let nli = Arc::new(OnnxNli::new(config.nli_cache_dir.clone()));
        Self::new(config, nli)
    }

    /// Prune verification chunks by embedding similarity instead of rank
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Whether verification should run at all
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Verify a response against the retrieved chunks
    pub async fn verify(&self, response: &str, hits: &[Hit]) -> Result<VerificationReport> {
        let claims = self.extractor.extract(response);
        if claims.is_empty() {
            // Refusals and clarifying questions carry no factual claims.
            return Ok(VerificationReport {
                is_safe: true,
                faithfulness: 1.0,
                assessments: Vec::new(),
                flagged: Vec::new(),
                safe_response: None,
            });
        }

        let mut assessments: Vec<ClaimAssessment> = Vec::with_capacity(claims.len());
        let mut contradictions = 0usize;
        let mut consecutive_supported = 0usize;
        let mut assumed_rest_supported = false;

        for (i, claim) in claims.iter().enumerate() {
            if contradictions >= self.config.short_circuit_fail_count.max(1) {
                // The response is already unsafe; stop spending inference.
                assessments.push(ClaimAssessment {
                    claim: claim.clone(),
                    verdict: ClaimVerdict::Unverified,
                });
                continue;
            }
            if assumed_rest_supported {
                assessments.push(ClaimAssessment {
                    claim: claim.clone(),
                    verdict: ClaimVerdict::Supported,
                });
                continue;
            }

            let verdict = self.verdict_for_claim(claim, hits).await?;
            match verdict {
                ClaimVerdict::Supported => {
                    consecutive_supported += 1;
                    if contradictions == 0
                        && consecutive_supported >= self.config.short_circuit_pass_count.max(1)
                        && i + 1 < claims.len()
                    {
                        tracing::debug!(
                            verified = i + 1,
                            total = claims.len(),
                            "pass short-circuit engaged"
                        );
                        assumed_rest_supported = true;
                    }
                }
                ClaimVerdict::Contradicted => {
                    contradictions += 1;
                    consecutive_supported = 0;
                }
                ClaimVerdict::Unverified => {
                    consecutive_supported = 0;
                }
            }
            assessments.push(ClaimAssessment {
                claim: claim.clone(),
                verdict,
            });
        }

        let supported = assessments
            .iter()
            .filter(|a| a.verdict == ClaimVerdict::Supported)
            .count();
        let faithfulness = supported as f32 / assessments.len() as f32;
        let flagged: Vec<String> = assessments
            .iter()
            .filter(|a| a.verdict != ClaimVerdict::Supported)
            .map(|a| a.claim.clone())
            .collect();

        // The single failure predicate: the rewrite and is_safe both hang
        // off this value and nothing else.
        let failed = contradictions > 0 || faithfulness < self.config.faithfulness_threshold;

        let safe_response = if failed {
            let supported_claims: Vec<&str> = assessments
                .iter()
                .filter(|a| a.verdict == ClaimVerdict::Supported)
                .map(|a| a.claim.as_str())
                .collect();
            Some(build_safe_response(&supported_claims))
        } else {
            None
        };

        if failed {
            tracing::warn!(
                faithfulness,
                contradictions,
                flagged = flagged.len(),
                "response failed verification"
            );
        }

        Ok(VerificationReport {
            is_safe: !failed,
            faithfulness,
            assessments,
            flagged,
            safe_response,
        })
    }

    /// Dual-path agreement: do two independently produced answers entail
    /// each other's claims? Used by the optional two-model mode.
    pub async fn responses_agree(&self, a: &str, b: &str) -> Result<bool> {
        let claims = self.extractor.extract(a);
        if claims.is_empty() {
            return Ok(true);
        }
        let mut agreed = 0usize;
        for claim in &claims {
            let scores = self.nli.classify(b, claim).await?;
            if scores.contradiction >= CONTRADICTION_THRESHOLD {
                return Ok(false);
            }
            if scores.entailment >= ENTAILMENT_THRESHOLD {
                agreed += 1;
            }
        }
        Ok(agreed * 2 >= claims.len())
    }

    /// Fast structural check: no model load, no network. Verifies the
    /// pipeline can be constructed and that trivial scoring behaves.
    pub fn self_test(&self) -> Result<()> {
        let claims = self
            .extractor
            .extract("Water boils at one hundred degrees Celsius.");
        if claims.len() != 1 {
            return Err(Error::Verification(format!(
                "claim extractor produced {} claims for a single sentence",
                claims.len()
            )));
        }

        // One supported claim out of one must clear any valid threshold.
        let faithfulness = 1.0f32;
        if faithfulness < self.config.faithfulness_threshold {
            return Err(Error::Verification(
                "faithfulness threshold rejects a fully supported response".to_string(),
            ));
        }

        let rewrite = build_safe_response(&claims.iter().map(|c| c.as_str()).collect::<Vec<_>>());
        if rewrite.is_empty() || rewrite == claims[0] {
            return Err(Error::Verification(
                "safe rewrite construction is broken".to_string(),
            ));
        }

        tracing::debug!("hallucination guard self-test passed");
        Ok(())
    }

    async fn verdict_for_claim(&self, claim: &str, hits: &[Hit]) -> Result<ClaimVerdict> {
        let premises = self.prune_chunks(claim, hits).await?;
        if premises.is_empty() {
            return Ok(ClaimVerdict::Unverified);
        }

        let mut max_contradiction = 0.0f32;
        for premise in premises {
            let scores = self.nli.classify(&premise, claim).await?;
            if scores.entailment >= ENTAILMENT_THRESHOLD {
                return Ok(ClaimVerdict::Supported);
            }
            max_contradiction = max_contradiction.max(scores.contradiction);
        }

        if max_contradiction >= CONTRADICTION_THRESHOLD {
            Ok(ClaimVerdict::Contradicted)
        } else {
            Ok(ClaimVerdict::Unverified)
        }
    }

    /// Top-M chunks to verify a claim against: by embedding similarity when
    /// an embedder is attached, by retrieval rank otherwise.
    async fn prune_chunks(&self, claim: &str, hits: &[Hit]) -> Result<Vec<String>> {
        let m = self.config.chunk_prune_k.max(1);
        if hits.len() <= m {
            return Ok(hits.iter().map(|h| h.chunk.text.clone()).collect());
        }

        match &self.embedder {
            Some(embedder) => {
                let claim_vec = embedder.embed_one(claim).await?;
                let texts: Vec<String> = hits.iter().map(|h| h.chunk.text.clone()).collect();
                let chunk_vecs = embedder.embed_batch(&texts).await?;

                let mut scored: Vec<(usize, f32)> = chunk_vecs
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i, cosine_similarity(&claim_vec, v)))
                    .collect();
                scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                Ok(scored
                    .into_iter()
                    .take(m)
                    .map(|(i, _)| hits[i].chunk.text.clone())
                    .collect())
            }
            None => Ok(hits.iter().take(m).map(|h| h.chunk.text.clone()).collect()),
        }
    }
}

/// Build the safe rewrite shown instead of (or next to) a failed response.
/// The leading notice guarantees the rewrite is never byte-identical to the
/// original answer.
fn build_safe_response(supported_claims: &[&str]) -> String {
    let mut out = String::from(
        "Parts of the generated answer could not be verified against the retrieved documents and were removed.\n",
    );
    if supported_claims.is_empty() {
        out.push_str(REFUSAL_PHRASE);
    } else {
        out.push_str("Verified content:\n");
        for claim in supported_claims {
            out.push_str("- ");
            out.push_str(claim);
            out.push('\n');
        }
    }
    out
}
