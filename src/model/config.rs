use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Which model family a configuration builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Causal language model: one causal block stack over a single sequence.
    #[default]
    DecoderOnly,
    /// Sequence-to-sequence model: bidirectional encoder plus causal decoder
    /// with cross-attention.
    EncoderDecoder,
}

/// How position information reaches the attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionalKind {
    /// Learned absolute position table added to the token embeddings.
    #[default]
    Learned,
    /// Per-head linear distance bias added to raw attention scores.
    Alibi,
}

/// Model hyperparameters.
///
/// Immutable once a model has been built from it; every block borrows the same
/// instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default)]
    pub positional: PositionalKind,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Embedding dimension
    pub n_embd: usize,
    /// Number of transformer blocks (per stack for encoder-decoder)
    pub n_layer: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Context window length
    pub block_size: usize,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub sos_token_id: u32,
    /// Dropout on the summed input embeddings
    #[serde(default)]
    pub embd_pdrop: f32,
    /// Dropout on attention weights
    #[serde(default)]
    pub attn_pdrop: f32,
    /// Dropout on attention/MLP outputs before the residual add
    #[serde(default)]
    pub resid_pdrop: f32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl ModelConfig {
    /// Dimension per attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] if the configuration is internally
    /// inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(ModelError::config("vocab_size must be positive"));
        }
        if self.n_embd == 0 || self.n_head == 0 || self.n_layer == 0 {
            return Err(ModelError::config(
                "n_embd, n_head and n_layer must be positive",
            ));
        }
        if !self.n_embd.is_multiple_of(self.n_head) {
            return Err(ModelError::config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.block_size == 0 {
            return Err(ModelError::config("block_size must be positive"));
        }
        for (name, p) in [
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
            ("resid_pdrop", self.resid_pdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(ModelError::config(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        let vocab = self.vocab_size;
        for (name, id) in [
            ("pad_token_id", self.pad_token_id),
            ("eos_token_id", self.eos_token_id),
            ("sos_token_id", self.sos_token_id),
        ] {
            if id as usize >= vocab {
                return Err(ModelError::config(format!(
                    "{name} ({id}) must be below vocab_size ({vocab})"
                )));
            }
        }
        if self.architecture == Architecture::EncoderDecoder
            && self.positional == PositionalKind::Alibi
        {
            return Err(ModelError::config(
                "ALiBi positions are only supported for decoder-only models",
            ));
        }
        Ok(())
    }

    /// Minimal config for unit tests.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            architecture: Architecture::DecoderOnly,
            positional: PositionalKind::Learned,
            vocab_size: 32,
            n_embd: 16,
            n_layer: 2,
            n_head: 2,
            block_size: 8,
            pad_token_id: 0,
            eos_token_id: 0,
            sos_token_id: 1,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            resid_pdrop: 0.0,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    /// Small decoder-only model with learned positions.
    #[must_use]
    pub fn small() -> Self {
        Self {
            architecture: Architecture::DecoderOnly,
            positional: PositionalKind::Learned,
            vocab_size: 259,
            n_embd: 256,
            n_layer: 4,
            n_head: 4,
            block_size: 256,
            pad_token_id: 0,
            eos_token_id: 1,
            sos_token_id: 2,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    /// Deeper decoder-only model using ALiBi instead of a position table.
    #[must_use]
    pub fn alibi() -> Self {
        Self {
            positional: PositionalKind::Alibi,
            n_embd: 384,
            n_layer: 8,
            n_head: 8,
            block_size: 512,
            ..Self::small()
        }
    }

    /// Encoder-decoder model for source/target pairs.
    #[must_use]
    pub fn seq2seq() -> Self {
        Self {
            architecture: Architecture::EncoderDecoder,
            positional: PositionalKind::Learned,
            n_embd: 256,
            n_layer: 3,
            n_head: 4,
            block_size: 128,
            ..Self::small()
        }
    }

    /// Look up a named preset.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] for an unknown name.
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            "small" => Ok(Self::small()),
            "alibi" => Ok(Self::alibi()),
            "seq2seq" => Ok(Self::seq2seq()),
            other => Err(ModelError::config(format!(
                "unknown preset {other:?} (expected tiny, small, alibi or seq2seq)"
            ))),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::small()
    }
}
