//! Text embedding providers

pub mod onnx;

use async_trait::async_trait;

use crate::error::Result;

pub use onnx::OnnxEmbedder;

/// Trait for generating L2-normalized text embeddings
///
/// Implementations:
/// - `OnnxEmbedder`: local ONNX model resolved from the cache directory
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text (query-time path)
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, order-preserving.
    ///
    /// Default implementation calls `embed_one` sequentially; implementations
    /// should override with true batching.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_one(text).await?);
        }
        Ok(embeddings)
    }

    /// Embedding dimension, fixed after initialization
    fn dimensions(&self) -> usize;

    /// Check the provider is usable
    async fn health_check(&self) -> Result<bool>;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Release model resources; idempotent
    fn shutdown(&self) {}
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
