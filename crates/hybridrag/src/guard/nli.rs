//! Natural Language Inference provider
//!
//! The production implementation runs a local ONNX cross-encoder. The model
//! is loaded lazily under a mutex so that concurrent verifiers do not race
//! on first use and unverified queries never pay the load cost.

use std::path::PathBuf;

use async_trait::async_trait;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// Probabilities over the three NLI labels
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NliScores {
    pub entailment: f32,
    pub neutral: f32,
    pub contradiction: f32,
}

/// Verdict for one claim against the retrieved context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimVerdict {
    Supported,
    Contradicted,
    Unverified,
}

/// Classifies (premise, hypothesis) pairs
#[async_trait]
pub trait NliProvider: Send + Sync {
    /// Probability that `premise` entails / is neutral to / contradicts
    /// `hypothesis`
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<NliScores>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

struct NliModel {
    session: Session,
    tokenizer: Tokenizer,
}

/// Local ONNX cross-encoder NLI provider
pub struct OnnxNli {
    /// Lazily initialized; the mutex also serializes inference
    model: Mutex<Option<NliModel>>,
    cache_dir: PathBuf,
    max_length: usize,
}

/// MNLI-style head output order
const LABEL_CONTRADICTION: usize = 0;
const LABEL_NEUTRAL: usize = 1;
const LABEL_ENTAILMENT: usize = 2;

impl OnnxNli {
    /// Create the provider without loading the model
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            model: Mutex::new(None),
            cache_dir,
            max_length: 256,
        }
    }

    fn load_model(cache_dir: &PathBuf) -> Result<NliModel> {
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");
        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(Error::Verification(format!(
                    "NLI model file '{}' is missing from the local cache",
                    path.display()
                )));
            }
        }

        tracing::info!(dir = %cache_dir.display(), "loading NLI cross-encoder");
        let session = Session::builder()
            .map_err(|e| Error::Verification(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::Verification(format!("Failed to set optimization level: {}", e)))?
            .commit_from_file(&model_path)
            .map_err(|e| Error::Verification(format!("Failed to load NLI model: {}", e)))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::Verification(format!("Failed to load NLI tokenizer: {}", e)))?;

        Ok(NliModel { session, tokenizer })
    }

    fn classify_sync(&self, premise: &str, hypothesis: &str) -> Result<NliScores> {
        let mut guard = self.model.lock();
        if guard.is_none() {
            *guard = Some(Self::load_model(&self.cache_dir)?);
        }
        let model = guard.as_mut().expect("just initialized");

        let encoding = model
            .tokenizer
            .encode((premise, hypothesis), true)
            .map_err(|e| Error::Verification(format!("NLI tokenization failed: {}", e)))?;

        let len = encoding.get_ids().len().clamp(1, self.max_length);
        let ids: Vec<i64> = encoding.get_ids()[..len].iter().map(|&v| v as i64).collect();
        let mask: Vec<i64> = encoding.get_attention_mask()[..len]
            .iter()
            .map(|&v| v as i64)
            .collect();
        let types: Vec<i64> = encoding.get_type_ids()[..len]
            .iter()
            .map(|&v| v as i64)
            .collect();

        let make = |data: Vec<i64>| {
            Tensor::from_array((vec![1usize, len], data.into_boxed_slice()))
                .map_err(|e| Error::Verification(format!("Tensor creation failed: {}", e)))
        };
        let inputs = vec![
            ("input_ids", make(ids)?.into_dyn()),
            ("attention_mask", make(mask)?.into_dyn()),
            ("token_type_ids", make(types)?.into_dyn()),
        ];

        let outputs = model
            .session
            .run(inputs)
            .map_err(|e| Error::Verification(format!("NLI inference failed: {}", e)))?;

        let output_iter: Vec<_> = outputs.iter().collect();
        let output = output_iter
            .first()
            .map(|(_, v)| v)
            .ok_or_else(|| Error::Verification("No NLI output tensor".to_string()))?;
        let (_, logits) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Verification(format!("Failed to extract logits: {}", e)))?;

        if logits.len() < 3 {
            return Err(Error::Verification(format!(
                "NLI head produced {} logits, expected 3",
                logits.len()
            )));
        }
        let probs = softmax(&logits[..3]);

        Ok(NliScores {
            contradiction: probs[LABEL_CONTRADICTION],
            neutral: probs[LABEL_NEUTRAL],
            entailment: probs[LABEL_ENTAILMENT],
        })
    }
}

#[async_trait]
impl NliProvider for OnnxNli {
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<NliScores> {
        self.classify_sync(premise, hypothesis)
    }

    fn name(&self) -> &str {
        "onnx-nli"
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
