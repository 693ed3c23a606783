//! Position information: learned absolute embeddings or ALiBi score biases.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module};

use super::config::{ModelConfig, PositionalKind};
use super::params::{Scope, embedding};
use crate::error::{ModelError, Result};

/// Learned absolute position table `[block_size, n_embd]`.
pub struct LearnedPositions {
    table: Embedding,
    block_size: usize,
}

impl LearnedPositions {
    /// # Errors
    /// Returns an error if parameter creation fails.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        Ok(Self {
            table: embedding(config.block_size, config.n_embd, scope)?,
            block_size: config.block_size,
        })
    }

    /// Embeddings for positions `offset..offset + len`, shape `(1, len, n_embd)`.
    ///
    /// # Errors
    /// Returns [`ModelError::Index`] if any position is outside the table.
    pub fn forward(&self, offset: usize, len: usize, device: &Device) -> Result<Tensor> {
        let end = offset + len;
        if end > self.block_size {
            return Err(ModelError::Index(format!(
                "position {} out of range for context window {}",
                end.saturating_sub(1),
                self.block_size
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let positions = Tensor::arange(offset as u32, end as u32, device)?;
        Ok(self.table.forward(&positions)?.unsqueeze(0)?)
    }
}

/// Attention with Linear Biases.
///
/// Each head `h` adds `-m_h * |i - j|` to the raw score between query `i` and
/// key `j`. The slopes form a geometric sequence over the heads, so no position
/// table is learned and longer sequences than seen in training still work.
#[derive(Debug, Clone)]
pub struct Alibi {
    slopes: Vec<f32>,
}

impl Alibi {
    /// # Errors
    /// Returns [`ModelError::Configuration`] if `num_heads` is zero.
    pub fn new(num_heads: usize) -> Result<Self> {
        if num_heads == 0 {
            return Err(ModelError::config("num_heads must be > 0"));
        }
        Ok(Self {
            slopes: Self::compute_slopes(num_heads),
        })
    }

    /// `2^(-8h/n)` for the closest power of two `n`; remaining heads take the
    /// odd-indexed slopes of the next power of two.
    #[allow(clippy::cast_precision_loss)]
    fn compute_slopes(num_heads: usize) -> Vec<f32> {
        let closest = if num_heads.is_power_of_two() {
            num_heads
        } else {
            num_heads.next_power_of_two() / 2
        };
        let ratio = 8.0 / closest as f32;
        let mut slopes: Vec<f32> = (0..closest)
            .map(|i| 2f32.powf(-((i + 1) as f32) * ratio))
            .collect();

        if num_heads > closest {
            let extra_ratio = 4.0 / closest as f32;
            slopes.extend(
                (0..num_heads - closest).map(|i| 2f32.powf(-((2 * i + 1) as f32) * extra_ratio)),
            );
        }
        slopes
    }

    #[must_use]
    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }

    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.slopes.len()
    }

    /// Bias of shape `(1, heads, q_len, k_len)`.
    ///
    /// Queries are aligned to the end of the key range, so query `i` sits at
    /// absolute position `k_len - q_len + i`.
    ///
    /// # Errors
    /// Returns [`ModelError::Shape`] if `q_len > k_len`.
    #[allow(clippy::cast_precision_loss)]
    pub fn bias(&self, q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
        if q_len > k_len {
            return Err(ModelError::shape(format!(
                "ALiBi query length {q_len} exceeds key length {k_len}"
            )));
        }
        let offset = k_len - q_len;
        let mut data = Vec::with_capacity(self.slopes.len() * q_len * k_len);
        for &slope in &self.slopes {
            for i in 0..q_len {
                let qpos = (offset + i) as f32;
                for j in 0..k_len {
                    data.push(-slope * (qpos - j as f32).abs());
                }
            }
        }
        Ok(Tensor::from_vec(
            data,
            (1, self.slopes.len(), q_len, k_len),
            device,
        )?)
    }
}

/// Position provider selected by [`PositionalKind`].
pub enum PositionalBias {
    Learned(LearnedPositions),
    Alibi(Alibi),
}

impl PositionalBias {
    /// # Errors
    /// Returns an error if parameter creation fails.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        match config.positional {
            PositionalKind::Learned => Ok(Self::Learned(LearnedPositions::new(config, scope)?)),
            PositionalKind::Alibi => Ok(Self::Alibi(Alibi::new(config.n_head)?)),
        }
    }

    /// Term added to the token embeddings, if this provider has one.
    ///
    /// # Errors
    /// Returns [`ModelError::Index`] for positions outside the learned table.
    pub fn embeddings(&self, len: usize, device: &Device) -> Result<Option<Tensor>> {
        match self {
            Self::Learned(table) => table.forward(0, len, device).map(Some),
            Self::Alibi(_) => Ok(None),
        }
    }

    /// Term added to the raw attention scores, if this provider has one.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn attention_bias(
        &self,
        q_len: usize,
        k_len: usize,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        match self {
            Self::Learned(_) => Ok(None),
            Self::Alibi(alibi) => Ok(Some(alibi.bias(q_len, k_len, device)?.to_dtype(DType::F32)?)),
        }
    }
}
