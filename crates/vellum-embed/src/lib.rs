//! vellum-embed — local retrieval embeddings.
//!
//! Runs the `BAAI/bge-base-en-v1.5` sentence encoder with Candle: model
//! files come from the Hugging Face Hub, inference happens in-process on
//! the best available device, and output vectors are pooled and
//! L2-normalized for cosine retrieval.
//!
//! BGE embeds queries and documents asymmetrically: documents are encoded
//! as-is via [`BgeEmbedder::embed`], queries get a fixed instruction
//! prefix via [`BgeEmbedder::embed_query`].

pub mod config;
pub mod embedder;
pub mod error;
pub mod pooling;

pub use config::{EmbeddingConfig, EMBEDDING_DIM, QUERY_INSTRUCTION};
pub use embedder::BgeEmbedder;
pub use error::{EmbedError, Result};
pub use pooling::PoolingStrategy;
