//! BGE embedder using Candle.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{EMBEDDING_DIM, QUERY_INSTRUCTION};
use crate::pooling::l2_normalize;
use crate::{EmbedError, EmbeddingConfig, Result};

/// Sentence encoder for the BGE retrieval family.
///
/// Construct once, before spawning workers, and share the handle by
/// reference: the model files are downloaded and loaded at construction,
/// so there is no one-time initialization left to race over. Inference
/// itself takes `&self` and is safe to call concurrently.
pub struct BgeEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    config: EmbeddingConfig,
}

impl BgeEmbedder {
    /// Download (or reuse the local Hub cache for) the model files and
    /// load the encoder onto the best available device.
    pub async fn new(config: EmbeddingConfig) -> Result<Self> {
        let start = Instant::now();
        info!(model = %config.model_id, "loading embedding model");

        let device = Self::select_device(&config);
        debug!(?device, "selected compute device");

        // hf-hub's sync API does blocking network IO; keep it off the
        // async runtime threads.
        let model_id = config.model_id.clone();
        let (bert_config, tokenizer, weights_path) = tokio::task::spawn_blocking(move || {
            let api = Api::new().map_err(|e| EmbedError::Download(format!("hub API init: {e}")))?;
            let repo = api.repo(Repo::new(model_id, RepoType::Model));

            let config_path = repo
                .get("config.json")
                .map_err(|e| EmbedError::Download(format!("config.json: {e}")))?;
            let bert_config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;

            let tokenizer_path = repo
                .get("tokenizer.json")
                .map_err(|e| EmbedError::Download(format!("tokenizer.json: {e}")))?;
            let tokenizer =
                Tokenizer::from_file(&tokenizer_path).map_err(|e| EmbedError::Tokenizer(e.to_string()))?;

            let weights_path = repo
                .get("model.safetensors")
                .or_else(|_| repo.get("pytorch_model.bin"))
                .map_err(|e| EmbedError::Download(format!("model weights: {e}")))?;

            Ok::<_, EmbedError>((bert_config, tokenizer, weights_path))
        })
        .await
        .map_err(|e| EmbedError::Download(e.to_string()))??;

        let is_safetensors = weights_path
            .extension()
            .map(|e| e == "safetensors")
            .unwrap_or(false);
        let vb = if is_safetensors {
            unsafe { VarBuilder::from_mmaped_safetensors(&[&weights_path], DType::F32, &device)? }
        } else {
            VarBuilder::from_pth(&weights_path, DType::F32, &device)?
        };
        let model = BertModel::load(vb, &bert_config)?;

        info!(
            elapsed_s = format!("{:.2}", start.elapsed().as_secs_f32()),
            "embedding model ready"
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            config,
        })
    }

    /// Best available device: CUDA, then Metal, then CPU.
    fn select_device(config: &EmbeddingConfig) -> Device {
        if !config.use_gpu {
            return Device::Cpu;
        }

        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("CUDA device available");
                    return device;
                }
                Err(e) => debug!("CUDA not available: {e}"),
            }
        }

        #[cfg(feature = "metal")]
        {
            match Device::new_metal(0) {
                Ok(device) => {
                    info!("Metal device available");
                    return device;
                }
                Err(e) => debug!("Metal not available: {e}"),
            }
        }

        Device::Cpu
    }

    /// Embed passages, batched at the device-appropriate batch size.
    /// Returns one 768-dim vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size()) {
            vectors.extend(self.forward_batch(batch)?);
        }

        debug!(
            n = texts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "embedded passages"
        );
        Ok(vectors)
    }

    /// Embed a search query. Queries are prefixed with the BGE retrieval
    /// instruction; never use this for passages.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let prompt = format!("{QUERY_INSTRUCTION}{text}");
        let mut vectors = self.forward_batch(&[prompt])?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::InvalidInput("no embedding produced".to_string()))
    }

    /// One forward pass over a single batch.
    fn forward_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(text_refs, true)
            .map_err(|e| EmbedError::Tokenizer(e.to_string()))?;

        let max_model_len = self.config.max_length.min(512);
        let mut input_ids: Vec<Vec<u32>> = Vec::with_capacity(texts.len());
        let mut attention_mask: Vec<Vec<u32>> = Vec::with_capacity(texts.len());
        let mut token_type_ids: Vec<Vec<u32>> = Vec::with_capacity(texts.len());

        for encoding in &encodings {
            let len = encoding.get_ids().len().min(max_model_len);
            input_ids.push(encoding.get_ids()[..len].to_vec());
            attention_mask.push(encoding.get_attention_mask()[..len].to_vec());
            token_type_ids.push(encoding.get_type_ids()[..len].to_vec());
        }

        // Pad every row to the longest sequence in the batch.
        let max_len = input_ids.iter().map(Vec::len).max().unwrap_or(0);
        for ((ids, mask), type_ids) in input_ids
            .iter_mut()
            .zip(attention_mask.iter_mut())
            .zip(token_type_ids.iter_mut())
        {
            let pad = max_len - ids.len();
            ids.extend(std::iter::repeat_n(0, pad));
            mask.extend(std::iter::repeat_n(0, pad));
            type_ids.extend(std::iter::repeat_n(0, pad));
        }

        let batch = texts.len();
        let input_ids = Tensor::new(input_ids, &self.device)?.reshape((batch, max_len))?;
        // pooling multiplies by the mask, so it has to be F32
        let attention_mask = Tensor::new(attention_mask, &self.device)?
            .reshape((batch, max_len))?
            .to_dtype(DType::F32)?;
        let token_type_ids = Tensor::new(token_type_ids, &self.device)?.reshape((batch, max_len))?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = self.config.pooling.apply(&hidden, &attention_mask)?;
        let pooled = if self.config.normalize {
            l2_normalize(&pooled)?
        } else {
            pooled
        };

        Ok(pooled.to_vec2::<f32>()?)
    }

    /// Output dimension (768 for bge-base).
    pub fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Effective batch size for the selected device.
    pub fn batch_size(&self) -> usize {
        if self.is_accelerated() {
            self.config.gpu_batch_size
        } else {
            self.config.cpu_batch_size
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self.device, Device::Cuda(_) | Device::Metal(_))
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }
}
