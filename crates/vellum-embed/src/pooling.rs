//! Pooling: token embeddings → one sentence vector.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// How to reduce the token dimension of the encoder output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub enum PoolingStrategy {
    /// Use the [CLS] token embedding. The BGE checkpoints are trained
    /// with this strategy.
    #[default]
    Cls,

    /// Mean over non-padding tokens.
    Mean,
}

impl PoolingStrategy {
    /// Reduce `(batch, seq_len, hidden)` token embeddings to
    /// `(batch, hidden)` sentence embeddings. `attention_mask` must be
    /// `(batch, seq_len)` in F32.
    pub fn apply(&self, embeddings: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            PoolingStrategy::Cls => cls_pool(embeddings),
            PoolingStrategy::Mean => mean_pool(embeddings, attention_mask),
        }
    }
}

/// First-token ([CLS]) embedding.
fn cls_pool(embeddings: &Tensor) -> candle_core::Result<Tensor> {
    embeddings.narrow(1, 0, 1)?.squeeze(1)
}

/// Mask-weighted mean over the sequence dimension.
fn mean_pool(embeddings: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
    let mask_expanded = attention_mask.unsqueeze(2)?.expand(embeddings.shape())?;
    let summed = (embeddings * &mask_expanded)?.sum(1)?;
    // clamp keeps an all-padding row from dividing by zero
    let counts = attention_mask.unsqueeze(2)?.sum(1)?.clamp(1e-9f32, f32::MAX)?;
    summed.broadcast_div(&counts)
}

/// L2-normalize `(batch, hidden)` embeddings row-wise.
pub fn l2_normalize(embeddings: &Tensor) -> candle_core::Result<Tensor> {
    let norms = embeddings.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-9f32, f32::MAX)?;
    embeddings.broadcast_div(&norms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn cls_pool_selects_first_token() {
        let device = Device::Cpu;
        let embeddings = Tensor::from_vec(
            vec![
                1.0f32, 2.0, // token 0
                9.0, 9.0, // token 1
                1.0, 1.0, // seq 2, token 0
                5.0, 5.0, // seq 2, token 1
            ],
            (2, 2, 2),
            &device,
        )
        .unwrap();
        let mask = Tensor::from_vec(vec![1.0f32, 1.0, 1.0, 1.0], (2, 2), &device).unwrap();

        let pooled = PoolingStrategy::Cls.apply(&embeddings, &mask).unwrap();
        let result = pooled.to_vec2::<f32>().unwrap();
        assert_eq!(result[0], vec![1.0, 2.0]);
        assert_eq!(result[1], vec![1.0, 1.0]);
    }

    #[test]
    fn mean_pool_ignores_padding() {
        let device = Device::Cpu;
        let embeddings = Tensor::from_vec(
            vec![
                1.0f32, 1.0, 1.0, 1.0, // token 0
                3.0, 3.0, 3.0, 3.0, // token 1
                5.0, 5.0, 5.0, 5.0, // token 2 (padding)
            ],
            (1, 3, 4),
            &device,
        )
        .unwrap();
        let mask = Tensor::from_vec(vec![1.0f32, 1.0, 0.0], (1, 3), &device).unwrap();

        let pooled = PoolingStrategy::Mean.apply(&embeddings, &mask).unwrap();
        let result = pooled.to_vec2::<f32>().unwrap();
        for value in &result[0] {
            assert!((value - 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn l2_normalize_yields_unit_rows() {
        let device = Device::Cpu;
        let embeddings =
            Tensor::from_vec(vec![3.0f32, 4.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0], (2, 4), &device)
                .unwrap();

        let normalized = l2_normalize(&embeddings).unwrap();
        let result = normalized.to_vec2::<f32>().unwrap();

        assert!((result[0][0] - 0.6).abs() < 1e-5);
        assert!((result[0][1] - 0.8).abs() < 1e-5);
        for row in result {
            let norm: f32 = row.iter().map(|x| x * x).sum();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }
}
