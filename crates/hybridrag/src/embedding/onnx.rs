//! ONNX-based embedding generation
//!
//! The model and tokenizer are resolved from the local cache directory only.
//! Nothing here opens a network connection: model downloads are an explicit
//! administrative operation gated elsewhere, and the boot pipeline sets the
//! offline environment flags before any model loads.

use std::path::PathBuf;

use async_trait::async_trait;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use tokenizers::Tokenizer;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

use super::EmbeddingProvider;

/// Local ONNX text embedder with mean pooling and L2 normalization
pub struct OnnxEmbedder {
    /// Session is not Sync-shareable for mutable runs; serialize inference.
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
    max_length: usize,
    batch_size: usize,
}

impl OnnxEmbedder {
    /// Load the embedder from the local cache. The embedding dimension is
    /// read from a probe inference, then validated against the configured
    /// value when one is set.
    pub fn load(config: &EmbeddingConfig) -> Result<Self> {
        let model_dir = config.cache_dir.join(&config.model_name);
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(Error::embedding(format!(
                    "Model file '{}' is missing from the local cache",
                    path.display()
                )));
            }
        }

        tracing::info!(model = %config.model_name, "loading ONNX embedder");

        let session = Session::builder()
            .map_err(|e| Error::embedding(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::embedding(format!("Failed to set optimization level: {}", e)))?
            .with_intra_threads(num_cpus::get().min(4))
            .map_err(|e| Error::embedding(format!("Failed to set threads: {}", e)))?
            .commit_from_file(&model_path)
            .map_err(|e| Error::embedding(format!("Failed to load model: {}", e)))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::embedding(format!("Failed to load tokenizer: {}", e)))?;

        let mut embedder = Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions: 0,
            max_length: config.max_length,
            batch_size: config.batch_size.max(1),
        };

        // Probe the model for its hidden size instead of trusting config.
        let probe = embedder.run_batch(&["dimension probe".to_string()])?;
        let detected = probe.first().map(|v| v.len()).unwrap_or(0);
        if detected == 0 {
            return Err(Error::embedding("Model produced an empty embedding"));
        }
        if config.dimension != 0 && config.dimension != detected {
            return Err(Error::config(format!(
                "Configured embedding dimension {} does not match model dimension {}",
                config.dimension, detected
            )));
        }
        embedder.dimensions = detected;

        tracing::info!(dimensions = detected, "ONNX embedder ready");
        Ok(embedder)
    }

    /// Cache path for a model name, shared with administrative tooling
    pub fn model_dir(config: &EmbeddingConfig) -> PathBuf {
        config.cache_dir.join(&config.model_name)
    }

    fn run_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            all.extend(self.run_batch_internal(batch)?);
        }
        Ok(all)
    }

    fn run_batch_internal(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batch_size = texts.len();

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::embedding(format!("Tokenization failed: {}", e)))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .clamp(1, self.max_length);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let mut token_type_ids = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let types = encoding.get_type_ids();
            let len = ids.len().min(max_len);

            for j in 0..len {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
                token_type_ids[i * max_len + j] = types[j] as i64;
            }
        }

        let input_ids_tensor = Tensor::from_array((
            vec![batch_size, max_len],
            input_ids.into_boxed_slice(),
        ))
        .map_err(|e| Error::embedding(format!("Input tensor creation failed: {}", e)))?;

        let attention_tensor = Tensor::from_array((
            vec![batch_size, max_len],
            attention_mask.clone().into_boxed_slice(),
        ))
        .map_err(|e| Error::embedding(format!("Attention tensor creation failed: {}", e)))?;

        let token_type_tensor = Tensor::from_array((
            vec![batch_size, max_len],
            token_type_ids.into_boxed_slice(),
        ))
        .map_err(|e| Error::embedding(format!("Token type tensor creation failed: {}", e)))?;

        let inputs = vec![
            ("input_ids", input_ids_tensor.into_dyn()),
            ("attention_mask", attention_tensor.into_dyn()),
            ("token_type_ids", token_type_tensor.into_dyn()),
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| Error::embedding(format!("Inference failed: {}", e)))?;

        let output_iter: Vec<_> = outputs.iter().collect();
        let output = output_iter
            .iter()
            .find(|(name, _)| *name == "last_hidden_state")
            .or_else(|| output_iter.first())
            .map(|(_, v)| v)
            .ok_or_else(|| Error::embedding("No output tensor"))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::embedding(format!("Failed to extract tensor: {}", e)))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let hidden_size = dims.get(2).copied().unwrap_or(0);
        if hidden_size == 0 {
            return Err(Error::embedding("Output tensor has no hidden dimension"));
        }

        // Mean pooling over the attention mask, then L2 normalization.
        let mut embeddings = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let mut sum = vec![0.0f32; hidden_size];
            let mut count = 0.0f32;

            for j in 0..max_len {
                let mask_val = attention_mask[i * max_len + j] as f32;
                if mask_val > 0.0 {
                    for k in 0..hidden_size {
                        let idx = i * max_len * hidden_size + j * hidden_size + k;
                        if idx < data.len() {
                            sum[k] += data[idx] * mask_val;
                        }
                    }
                    count += mask_val;
                }
            }

            if count > 0.0 {
                for val in &mut sum {
                    *val /= count;
                }
            }

            let norm: f32 = sum.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for val in &mut sum {
                    *val /= norm;
                }
            }

            embeddings.push(sum);
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.run_batch(&[text.to_string()])?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("Empty embedding result"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.run_batch(texts)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.dimensions > 0)
    }

    fn name(&self) -> &str {
        "onnx"
    }
}
