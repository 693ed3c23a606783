//! Decoder-only causal language model.
//!
//! Token embedding plus either learned positions or ALiBi, a stack of causal
//! pre-norm blocks, a final layer norm and an LM head tied to the embedding.

use candle_core::{Device, Tensor};
use candle_nn::{Dropout, Linear, Module};

use super::config::ModelConfig;
use super::embedding::TokenEmbedding;
use super::head::ModelOutput;
use super::layers::{BlockInputs, LayerNorm, TransformerBlock};
use super::loss::shifted_cross_entropy;
use super::mask::{
    causal_mask, causal_padding_mask, dims2, to_additive, validate_attention_mask,
};
use super::params::Scope;
use super::position::PositionalBias;
use crate::error::{ModelError, Result};
use crate::inference::generate::LogitsSource;

/// GPT-style decoder.
///
/// Features:
/// - Learned absolute positions or ALiBi score biases
/// - Causal attention combined with optional key padding
/// - Weight tying between embeddings and LM head
pub struct DecoderOnly {
    /// Token embedding
    wte: TokenEmbedding,
    positions: PositionalBias,
    drop: Dropout,
    /// Transformer blocks
    blocks: Vec<TransformerBlock>,
    /// Final layer norm
    ln_f: LayerNorm,
    /// Language model head (shares its weight with `wte`)
    lm_head: Linear,
    config: ModelConfig,
    device: Device,
}

impl DecoderOnly {
    /// Build the model, creating its parameters under `scope`.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] for invalid hyperparameters.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        config.validate()?;

        let wte = TokenEmbedding::new(config, &scope.pp("wte"))?;
        let positions = PositionalBias::new(config, &scope.pp("wpe"))?;
        let blocks = (0..config.n_layer)
            .map(|i| TransformerBlock::new(config, false, &scope.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = LayerNorm::new(config.n_embd, config.layer_norm_eps, &scope.pp("ln_f"))?;
        let lm_head = wte.tied_head();

        Ok(Self {
            wte,
            positions,
            drop: Dropout::new(config.embd_pdrop),
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
            device: scope.device().clone(),
        })
    }

    /// Forward pass through the model.
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs of shape (batch, seq_len)
    /// * `attention_mask` - Optional keep flags of shape (batch, seq_len)
    /// * `labels` - Optional targets of shape (batch, seq_len), scored shifted by one
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Logits of shape (batch, seq_len, vocab_size) and the loss when labels are given.
    ///
    /// # Errors
    /// Returns [`ModelError::Shape`] when the mask or labels disagree with the
    /// tokens and [`ModelError::Configuration`] if the sequence is longer than
    /// the context window.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<ModelOutput> {
        let (b, t) = dims2(input_ids, "input ids")?;
        if t == 0 {
            return Err(ModelError::shape("input ids must contain at least one position"));
        }
        log::debug!("decoder forward: batch={b} seq={t} train={train}");

        let mask = match attention_mask {
            Some(keep) => {
                validate_attention_mask(input_ids, keep)?;
                causal_padding_mask(keep, self.config.block_size)?
            }
            None => causal_mask(t, self.config.block_size, &self.device)?
                .unsqueeze(0)?
                .unsqueeze(0)?,
        };
        let mask = to_additive(&mask)?;
        let position_bias = self.positions.attention_bias(t, t, &self.device)?;

        let mut x = self.wte.forward(input_ids)?;
        if let Some(pos) = self.positions.embeddings(t, &self.device)? {
            x = x.broadcast_add(&pos)?;
        }
        let mut x = self.drop.forward(&x, train)?;

        let inputs = BlockInputs {
            self_mask: Some(&mask),
            position_bias: position_bias.as_ref(),
            train,
            ..BlockInputs::default()
        };
        for block in &self.blocks {
            x = block.forward(&x, &inputs)?;
        }
        let x = self.ln_f.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;

        let loss = match labels {
            Some(labels) => {
                if labels.dims() != input_ids.dims() {
                    return Err(ModelError::shape(format!(
                        "labels {:?} must match input ids {:?}",
                        labels.dims(),
                        input_ids.dims()
                    )));
                }
                Some(shifted_cross_entropy(&logits, labels)?)
            }
            None => None,
        };
        Ok(ModelOutput { logits, loss })
    }

    /// Get logits for the last token only, in evaluation mode.
    ///
    /// # Returns
    /// Logits for last position of shape (batch, vocab_size)
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn forward_last(&self, input_ids: &Tensor) -> Result<Tensor> {
        let logits = self.forward(input_ids, None, None, false)?.logits;
        let (_, t, _) = logits.dims3()?;
        Ok(logits.narrow(1, t - 1, 1)?.squeeze(1)?)
    }

    /// Token embedding matrix, also used as the LM head weight.
    #[must_use]
    pub fn token_embedding(&self) -> &Tensor {
        self.wte.weights()
    }

    #[must_use]
    pub fn lm_head_weight(&self) -> &Tensor {
        self.lm_head.weight()
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl LogitsSource for DecoderOnly {
    fn context_window(&self) -> usize {
        self.config.block_size
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.forward_last(&input)?.squeeze(0)?.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::PositionalKind;
    use crate::model::params::ParamStore;
    use candle_core::DType;

    fn build(config: &ModelConfig, store: &ParamStore) -> DecoderOnly {
        DecoderOnly::new(config, &store.root()).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(0, &device);
        let model = build(&config, &store);

        let input = Tensor::new(&[[3u32, 4, 5, 6], [7, 8, 9, 10]], &device).unwrap();
        let out = model.forward(&input, None, None, false).unwrap();
        assert_eq!(out.logits.dims(), &[2, 4, config.vocab_size]);
        assert!(out.loss.is_none());
    }

    #[test]
    fn test_loss_with_labels_is_finite() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(1, &device);
        let model = build(&config, &store);

        let input = Tensor::new(&[[3u32, 4, 5, 6, 7]], &device).unwrap();
        let out = model.forward(&input, None, Some(&input), false).unwrap();
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_sequence_longer_than_context_is_rejected() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(0, &device);
        let model = build(&config, &store);

        let input = Tensor::ones((1, config.block_size + 1), DType::U32, &device).unwrap();
        assert!(matches!(
            model.forward(&input, None, None, false),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn test_mismatched_mask_and_labels() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(0, &device);
        let model = build(&config, &store);

        let input = Tensor::ones((2, 4), DType::U32, &device).unwrap();
        let mask = Tensor::ones((1, 4), DType::U8, &device).unwrap();
        assert!(matches!(
            model.forward(&input, Some(&mask), None, false),
            Err(ModelError::Shape(_))
        ));

        let labels = Tensor::ones((2, 3), DType::I64, &device).unwrap();
        assert!(matches!(
            model.forward(&input, None, Some(&labels), false),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_padding_does_not_change_real_positions() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(2, &device);
        let model = build(&config, &store);

        let short = Tensor::new(&[[3u32, 4, 5]], &device).unwrap();
        let padded = Tensor::new(&[[3u32, 4, 5, 0, 0]], &device).unwrap();
        let keep = Tensor::new(&[[1u8, 1, 1, 0, 0]], &device).unwrap();

        let a = model.forward(&short, None, None, false).unwrap().logits;
        let b = model.forward(&padded, Some(&keep), None, false).unwrap().logits;
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.narrow(1, 0, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_alibi_variant_has_no_position_table() {
        let device = Device::Cpu;
        let config = ModelConfig {
            positional: PositionalKind::Alibi,
            ..ModelConfig::tiny()
        };
        let store = ParamStore::seeded(0, &device);
        let model = build(&config, &store);

        let names: Vec<String> = store.named_vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.iter().all(|n| !n.starts_with("wpe")));

        let input = Tensor::new(&[[1u32, 2, 3]], &device).unwrap();
        let logits = model.forward_last(&input).unwrap();
        assert_eq!(logits.dims(), &[1, config.vocab_size]);
    }

    #[test]
    fn test_logits_source_matches_forward_last() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let store = ParamStore::seeded(4, &device);
        let model = build(&config, &store);

        let via_trait = model.next_token_logits(&[5, 9, 2]).unwrap();
        let input = Tensor::new(&[[5u32, 9, 2]], &device).unwrap();
        let direct: Vec<f32> = model
            .forward_last(&input)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(via_trait, direct);
        assert_eq!(model.context_window(), config.block_size);
    }
}
