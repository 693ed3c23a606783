//! Common neural network layers.
//!
//! LayerNorm, MLP and the pre-norm TransformerBlock shared by every model variant.

use candle_core::{D, Tensor};
use candle_nn::{Dropout, Linear, Module};

use super::attention::MultiHeadAttention;
use super::config::ModelConfig;
use super::params::{ParamInit, Scope, WeightDecay, linear};
use crate::error::{ModelError, Result};

/// Layer normalization over the last dimension.
///
/// Written with elementary tensor ops so gradients flow through it.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// # Errors
    /// Returns an error if parameter creation fails.
    pub fn new(dim: usize, eps: f64, scope: &Scope<'_>) -> Result<Self> {
        Ok(Self {
            weight: scope.get(dim, "weight", ParamInit::Ones, WeightDecay::Skip)?,
            bias: scope.get(dim, "bias", ParamInit::Zeros, WeightDecay::Skip)?,
            eps,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Feed-forward network with GELU activation.
///
/// Standard transformer MLP with 4x hidden dimension expansion.
pub struct MLP {
    /// Up projection (n_embd -> 4 * n_embd)
    c_fc: Linear,
    /// Down projection (4 * n_embd -> n_embd)
    c_proj: Linear,
    dropout: Dropout,
}

impl MLP {
    /// # Errors
    /// Returns an error if parameter creation fails.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        let n_embd = config.n_embd;
        let hidden_dim = 4 * n_embd;
        Ok(Self {
            c_fc: linear(n_embd, hidden_dim, true, &scope.pp("c_fc"))?,
            c_proj: linear(hidden_dim, n_embd, true, &scope.pp("c_proj"))?,
            dropout: Dropout::new(config.resid_pdrop),
        })
    }

    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu()?;
        let h = self.c_proj.forward(&h)?;
        Ok(self.dropout.forward(&h, train)?)
    }
}

/// Per-call inputs shared by every block of a stack.
#[derive(Clone, Copy, Default)]
pub struct BlockInputs<'a> {
    /// Additive self-attention mask
    pub self_mask: Option<&'a Tensor>,
    /// Additive positional bias on self-attention scores (ALiBi)
    pub position_bias: Option<&'a Tensor>,
    /// Encoder output for cross-attention
    pub memory: Option<&'a Tensor>,
    /// Additive cross-attention mask over encoder positions
    pub memory_mask: Option<&'a Tensor>,
    pub train: bool,
}

struct CrossAttention {
    ln: LayerNorm,
    attn: MultiHeadAttention,
}

/// Transformer block with pre-norm architecture.
///
/// Structure: LayerNorm -> Attention -> Residual -> [LayerNorm -> Cross-Attention -> Residual]
/// -> LayerNorm -> MLP -> Residual
pub struct TransformerBlock {
    /// First layer norm (before attention)
    ln_1: LayerNorm,
    attn: MultiHeadAttention,
    /// Present only in decoder blocks of the encoder-decoder model
    cross: Option<CrossAttention>,
    /// Second layer norm (before MLP)
    ln_2: LayerNorm,
    mlp: MLP,
}

impl TransformerBlock {
    /// Create a block; `with_cross_attention` adds the encoder-decoder sublayer.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] for an invalid head split.
    pub fn new(config: &ModelConfig, with_cross_attention: bool, scope: &Scope<'_>) -> Result<Self> {
        let n_embd = config.n_embd;
        let eps = config.layer_norm_eps;

        let cross = if with_cross_attention {
            Some(CrossAttention {
                ln: LayerNorm::new(n_embd, eps, &scope.pp("ln_cross"))?,
                attn: MultiHeadAttention::new(config, &scope.pp("cross_attn"))?,
            })
        } else {
            None
        };

        Ok(Self {
            ln_1: LayerNorm::new(n_embd, eps, &scope.pp("ln_1"))?,
            attn: MultiHeadAttention::new(config, &scope.pp("attn"))?,
            cross,
            ln_2: LayerNorm::new(n_embd, eps, &scope.pp("ln_2"))?,
            mlp: MLP::new(config, &scope.pp("mlp"))?,
        })
    }

    /// Forward pass through the transformer block.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns [`ModelError::Shape`] if a cross-attention block gets no memory.
    pub fn forward(&self, x: &Tensor, inputs: &BlockInputs<'_>) -> Result<Tensor> {
        let h = self.ln_1.forward(x)?;
        let h = self.attn.forward(
            &h,
            None,
            inputs.self_mask,
            inputs.position_bias,
            inputs.train,
        )?;
        let mut x = (x + h)?;

        if let Some(cross) = &self.cross {
            let memory = inputs.memory.ok_or_else(|| {
                ModelError::shape("cross-attention block requires encoder output")
            })?;
            let h = cross.ln.forward(&x)?;
            let h = cross
                .attn
                .forward(&h, Some(memory), inputs.memory_mask, None, inputs.train)?;
            x = (x + h)?;
        }

        let h = self.ln_2.forward(&x)?;
        let h = self.mlp.forward(&h, inputs.train)?;
        Ok((x + h)?)
    }
}
