//! Token embedding shared with the output projection.

use candle_core::{DType, Tensor};
use candle_nn::{Embedding, Linear, Module};

use super::config::ModelConfig;
use super::params::{Scope, embedding};
use crate::error::{ModelError, Result};

/// Token embedding layer.
pub struct TokenEmbedding {
    /// Embedding weights
    embedding: Embedding,
    vocab_size: usize,
}

impl TokenEmbedding {
    /// # Errors
    /// Returns an error if parameter creation fails.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        Ok(Self {
            embedding: embedding(config.vocab_size, config.n_embd, scope)?,
            vocab_size: config.vocab_size,
        })
    }

    /// Forward pass through token embedding.
    ///
    /// # Arguments
    /// * `token_ids` - Token IDs of shape (batch, seq_len)
    ///
    /// # Returns
    /// Embeddings of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns [`ModelError::Index`] if a token id is outside the vocabulary.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        if token_ids.elem_count() > 0 {
            let max_id = token_ids
                .to_dtype(DType::U32)?
                .flatten_all()?
                .max(0)?
                .to_scalar::<u32>()?;
            if max_id as usize >= self.vocab_size {
                return Err(ModelError::Index(format!(
                    "token id {max_id} out of range for vocabulary of {}",
                    self.vocab_size
                )));
            }
        }
        Ok(self.embedding.forward(token_ids)?)
    }

    /// Get the embedding weights for weight tying with lm_head.
    #[must_use]
    pub fn weights(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Output projection `n_embd -> vocab_size` reusing the embedding matrix.
    ///
    /// The returned layer holds the very same variable, so gradients from both
    /// uses accumulate into one tensor and optimizer updates are seen by both.
    #[must_use]
    pub fn tied_head(&self) -> Linear {
        Linear::new(self.weights().clone(), None)
    }
}
