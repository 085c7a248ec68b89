//! Configuration for the embedding service.

use serde::{Deserialize, Serialize};

use crate::pooling::PoolingStrategy;

/// Output dimension of bge-base-en-v1.5.
pub const EMBEDDING_DIM: usize = 768;

/// Instruction prepended to search queries. BGE is trained asymmetrically:
/// passages are encoded bare, queries carry this prefix.
pub const QUERY_INSTRUCTION: &str =
    "Represent this sentence for searching relevant passages: ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Hugging Face model ID.
    pub model_id: String,

    /// Maximum sequence length in tokens (default: 512).
    pub max_length: usize,

    /// Batch size when running on CPU.
    pub cpu_batch_size: usize,

    /// Batch size when running on an accelerator (CUDA/Metal).
    pub gpu_batch_size: usize,

    /// L2-normalize output vectors (default: true).
    pub normalize: bool,

    /// Pooling strategy. The BGE family is trained for CLS pooling.
    pub pooling: PoolingStrategy,

    /// Probe for an accelerator before falling back to CPU.
    pub use_gpu: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: "BAAI/bge-base-en-v1.5".to_string(),
            max_length: 512,
            cpu_batch_size: 32,
            gpu_batch_size: 128,
            normalize: true,
            pooling: PoolingStrategy::Cls,
            use_gpu: true,
        }
    }
}

impl EmbeddingConfig {
    /// Config for CPU-only inference.
    pub fn cpu() -> Self {
        Self {
            use_gpu: false,
            ..Default::default()
        }
    }

    /// Use a custom model.
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}
