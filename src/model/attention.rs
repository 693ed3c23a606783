//! Multi-head attention.
//!
//! One implementation serves causal self-attention, bidirectional encoder
//! self-attention and decoder cross-attention: queries always come from the
//! hidden state, keys and values from either the hidden state or an encoder
//! memory.

use candle_core::{D, Tensor};
use candle_nn::{Dropout, Linear, Module};

use super::config::ModelConfig;
use super::params::{Scope, linear};
use crate::error::{ModelError, Result};

/// Multi-head scaled dot-product attention.
pub struct MultiHeadAttention {
    /// Query projection (n_embd -> n_embd)
    q_proj: Linear,
    /// Combined key/value projection (n_embd -> 2 * n_embd)
    kv_proj: Linear,
    /// Output projection (n_embd -> n_embd)
    c_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    n_head: usize,
    n_embd: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    /// Create a new attention layer.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] if the width does not split evenly
    /// across heads.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        let n_embd = config.n_embd;
        let n_head = config.n_head;
        if n_head == 0 || !n_embd.is_multiple_of(n_head) {
            return Err(ModelError::config(format!(
                "n_embd ({n_embd}) must be divisible by n_head ({n_head})"
            )));
        }

        Ok(Self {
            q_proj: linear(n_embd, n_embd, true, &scope.pp("q_proj"))?,
            kv_proj: linear(n_embd, 2 * n_embd, true, &scope.pp("kv_proj"))?,
            c_proj: linear(n_embd, n_embd, true, &scope.pp("c_proj"))?,
            attn_dropout: Dropout::new(config.attn_pdrop),
            resid_dropout: Dropout::new(config.resid_pdrop),
            n_head,
            n_embd,
            head_dim: config.head_dim(),
        })
    }

    /// (B, T, C) -> (B, n_head, T, head_dim)
    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        Ok(x.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Query-side hidden states (batch, q_len, n_embd)
    /// * `memory` - Key/value source (batch, k_len, n_embd); `None` for self-attention
    /// * `mask` - Additive mask broadcastable to (batch, heads, q_len, k_len)
    /// * `position_bias` - Additive positional bias (1, heads, q_len, k_len)
    /// * `train` - Enables dropout
    ///
    /// # Errors
    /// Returns [`ModelError::Shape`] if the inputs disagree in batch or width.
    #[allow(clippy::many_single_char_names)]
    pub fn forward(
        &self,
        x: &Tensor,
        memory: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, t, c) = x
            .dims3()
            .map_err(|_| ModelError::shape(format!("attention input must be rank 3, got {:?}", x.dims())))?;
        let source = memory.unwrap_or(x);
        let (sb, s, sc) = source
            .dims3()
            .map_err(|_| ModelError::shape(format!("attention memory must be rank 3, got {:?}", source.dims())))?;
        if c != self.n_embd || sc != self.n_embd || sb != b {
            return Err(ModelError::shape(format!(
                "attention expects width {} and matching batch, got query {:?} and memory {:?}",
                self.n_embd,
                x.dims(),
                source.dims()
            )));
        }

        let q = self.split_heads(&self.q_proj.forward(x)?, b, t)?;
        let kv = self.kv_proj.forward(source)?;
        let k = self.split_heads(&kv.narrow(D::Minus1, 0, self.n_embd)?, b, s)?;
        let v = self.split_heads(&kv.narrow(D::Minus1, self.n_embd, self.n_embd)?, b, s)?;

        // softmax(QK^T / sqrt(d_k) + bias + mask) V
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let mut att = (q.matmul(&k_t)? * scale)?;
        if let Some(bias) = position_bias {
            att = att.broadcast_add(bias)?;
        }
        if let Some(mask) = mask {
            att = att.broadcast_add(mask)?;
        }
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let att = self.attn_dropout.forward(&att, train)?;

        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.contiguous()?.reshape((b, t, self.n_embd))?;
        let y = self.c_proj.forward(&y)?;
        Ok(self.resid_dropout.forward(&y, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::{causal_mask, to_additive};
    use crate::model::params::ParamStore;
    use candle_core::{DType, Device};

    fn build(config: &ModelConfig, store: &ParamStore) -> MultiHeadAttention {
        MultiHeadAttention::new(config, &store.root().pp("attn")).unwrap()
    }

    #[test]
    fn test_self_attention_shape() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(0, &device);
        let attn = build(&config, &store);
        let x = Tensor::randn(0f32, 1.0, (2, 5, config.n_embd), &device).unwrap();
        let y = attn.forward(&x, None, None, None, false).unwrap();
        assert_eq!(y.dims(), &[2, 5, config.n_embd]);
    }

    #[test]
    fn test_cross_attention_uses_memory_length() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(0, &device);
        let attn = build(&config, &store);
        let x = Tensor::randn(0f32, 1.0, (1, 3, config.n_embd), &device).unwrap();
        let memory = Tensor::randn(0f32, 1.0, (1, 7, config.n_embd), &device).unwrap();
        let y = attn.forward(&x, Some(&memory), None, None, false).unwrap();
        assert_eq!(y.dims(), &[1, 3, config.n_embd]);
    }

    #[test]
    fn test_batch_mismatch_is_shape_error() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(0, &device);
        let attn = build(&config, &store);
        let x = Tensor::zeros((2, 3, config.n_embd), DType::F32, &device).unwrap();
        let memory = Tensor::zeros((1, 3, config.n_embd), DType::F32, &device).unwrap();
        assert!(matches!(
            attn.forward(&x, Some(&memory), None, None, false),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_causal_mask_blocks_future_tokens() {
        // Changing a future token must not change earlier outputs.
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(3, &device);
        let attn = build(&config, &store);
        let mask = to_additive(&causal_mask(4, 8, &device).unwrap())
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .unsqueeze(0)
            .unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, config.n_embd), &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 1, config.n_embd), &device).unwrap();
        let head = x.narrow(1, 0, 3).unwrap();
        let tail = (x.narrow(1, 3, 1).unwrap() + noise).unwrap();
        let x2 = Tensor::cat(&[&head, &tail], 1).unwrap();

        let y1 = attn.forward(&x, None, Some(&mask), None, false).unwrap();
        let y2 = attn.forward(&x2, None, Some(&mask), None, false).unwrap();
        let a: Vec<f32> = y1.narrow(1, 0, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = y2.narrow(1, 0, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-5);
        }
    }
}
