//! Unified model entry point.
//!
//! [`ModelHead`] owns the parameters and one architecture variant. Training
//! and generation code talk to it without caring which variant is inside.

use candle_core::{Device, Tensor};

use super::config::{Architecture, ModelConfig};
use super::params::ParamStore;
use super::seq2seq::EncoderDecoder;
use super::transformer::DecoderOnly;
use crate::error::{ModelError, Result};
use crate::inference::generate::{Generation, GenerationConfig, LogitsSource};

/// Logits of shape (batch, seq_len, vocab_size) and the loss when labels were given.
pub struct ModelOutput {
    pub logits: Tensor,
    pub loss: Option<Tensor>,
}

/// One batch of model inputs.
#[derive(Debug, Clone)]
pub enum Batch {
    /// Decoder-only input; `labels` are scored shifted by one position.
    Causal {
        input_ids: Tensor,
        attention_mask: Option<Tensor>,
        labels: Option<Tensor>,
    },
    /// Source/target pair; the source mask defaults to non-pad positions.
    Seq2Seq {
        source_ids: Tensor,
        source_mask: Option<Tensor>,
        target_ids: Tensor,
        labels: Option<Tensor>,
    },
}

impl Batch {
    /// Number of sequences in the batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        let ids = match self {
            Self::Causal { input_ids, .. } => input_ids,
            Self::Seq2Seq { target_ids, .. } => target_ids,
        };
        ids.dims().first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn has_labels(&self) -> bool {
        match self {
            Self::Causal { labels, .. } | Self::Seq2Seq { labels, .. } => labels.is_some(),
        }
    }
}

enum Variant {
    DecoderOnly(DecoderOnly),
    EncoderDecoder(EncoderDecoder),
}

/// A language model together with the parameters it exclusively owns.
pub struct ModelHead {
    params: ParamStore,
    config: ModelConfig,
    variant: Variant,
}

impl ModelHead {
    /// Build the architecture named by `config.architecture` in `params`.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] for an invalid configuration.
    pub fn new(config: ModelConfig, params: ParamStore) -> Result<Self> {
        config.validate()?;
        let root = params.root();
        let variant = match config.architecture {
            Architecture::DecoderOnly => Variant::DecoderOnly(DecoderOnly::new(&config, &root)?),
            Architecture::EncoderDecoder => {
                Variant::EncoderDecoder(EncoderDecoder::new(&config, &root)?)
            }
        };
        log::info!(
            "built {:?} model with {} parameters",
            config.architecture,
            params.num_parameters()
        );
        Ok(Self {
            params,
            config,
            variant,
        })
    }

    /// Fresh model with reproducible initial weights.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] for an invalid configuration.
    pub fn seeded(config: ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        Self::new(config, ParamStore::seeded(seed, device))
    }

    /// Run the model on `batch`. Dropout is active only when `train` is set.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] when the batch kind does not match
    /// the architecture, plus any error from the forward pass.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        match (&self.variant, batch) {
            (
                Variant::DecoderOnly(model),
                Batch::Causal {
                    input_ids,
                    attention_mask,
                    labels,
                },
            ) => model.forward(input_ids, attention_mask.as_ref(), labels.as_ref(), train),
            (
                Variant::EncoderDecoder(model),
                Batch::Seq2Seq {
                    source_ids,
                    source_mask,
                    target_ids,
                    labels,
                },
            ) => model.forward(
                source_ids,
                source_mask.as_ref(),
                target_ids,
                labels.as_ref(),
                train,
            ),
            _ => Err(ModelError::config(format!(
                "{:?} model cannot consume this batch kind",
                self.config.architecture
            ))),
        }
    }

    /// Next-token scorer for generation.
    ///
    /// Decoder-only models ignore `source`; encoder-decoder models require it.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] if an encoder-decoder model gets
    /// no source, plus any encoding error.
    pub fn logits_source(&self, source: Option<&[u32]>) -> Result<Box<dyn LogitsSource + '_>> {
        match &self.variant {
            Variant::DecoderOnly(model) => Ok(Box::new(model)),
            Variant::EncoderDecoder(model) => {
                let source = source.ok_or_else(|| {
                    ModelError::config("encoder-decoder generation requires a source sequence")
                })?;
                Ok(Box::new(model.condition(source)?))
            }
        }
    }

    /// Start a lazy generation.
    ///
    /// For encoder-decoder models an empty `prompt` becomes `[sos]`. When
    /// `config.eos_id` is unset the model's eos id is used.
    ///
    /// # Errors
    /// Returns an error for invalid settings or a failed encoding.
    pub fn generate(
        &self,
        prompt: Vec<u32>,
        source: Option<&[u32]>,
        mut config: GenerationConfig,
    ) -> Result<Generation<Box<dyn LogitsSource + '_>>> {
        let prompt = match (&self.variant, prompt.is_empty()) {
            (Variant::EncoderDecoder(_), true) => vec![self.config.sos_token_id],
            _ => prompt,
        };
        config.eos_id = config.eos_id.or(Some(self.config.eos_token_id));
        Generation::new(self.logits_source(source)?, prompt, config)
    }

    /// Token embedding matrix (vocab_size, n_embd).
    #[must_use]
    pub fn token_embedding(&self) -> &Tensor {
        match &self.variant {
            Variant::DecoderOnly(m) => m.token_embedding(),
            Variant::EncoderDecoder(m) => m.token_embedding(),
        }
    }

    /// Output projection weight (vocab_size, n_embd); tied to the embedding.
    #[must_use]
    pub fn lm_head_weight(&self) -> &Tensor {
        match &self.variant {
            Variant::DecoderOnly(m) => m.lm_head_weight(),
            Variant::EncoderDecoder(m) => m.lm_head_weight(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        self.params.device()
    }

    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.params.num_parameters()
    }

    #[must_use]
    pub fn as_decoder_only(&self) -> Option<&DecoderOnly> {
        match &self.variant {
            Variant::DecoderOnly(m) => Some(m),
            Variant::EncoderDecoder(_) => None,
        }
    }

    #[must_use]
    pub fn as_encoder_decoder(&self) -> Option<&EncoderDecoder> {
        match &self.variant {
            Variant::EncoderDecoder(m) => Some(m),
            Variant::DecoderOnly(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::loss::labels_from_targets;
    use candle_core::DType;

    fn seq2seq_tiny() -> ModelConfig {
        ModelConfig {
            architecture: Architecture::EncoderDecoder,
            ..ModelConfig::tiny()
        }
    }

    #[test]
    fn test_batch_kind_must_match_architecture() {
        let device = Device::Cpu;
        let model = ModelHead::seeded(ModelConfig::tiny(), 0, &device).unwrap();
        let ids = Tensor::ones((1, 3), DType::U32, &device).unwrap();
        let batch = Batch::Seq2Seq {
            source_ids: ids.clone(),
            source_mask: None,
            target_ids: ids,
            labels: None,
        };
        assert!(matches!(
            model.forward(&batch, false),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_config_aborts_construction() {
        let device = Device::Cpu;
        let config = ModelConfig {
            n_embd: 15,
            ..ModelConfig::tiny()
        };
        assert!(matches!(
            ModelHead::seeded(config, 0, &device),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn test_seq2seq_batch_forward() {
        let device = Device::Cpu;
        let config = seq2seq_tiny();
        let model = ModelHead::seeded(config.clone(), 0, &device).unwrap();
        let target = Tensor::new(&[[1u32, 5, 6, 0]], &device).unwrap();
        let batch = Batch::Seq2Seq {
            source_ids: Tensor::new(&[[7u32, 8, 0]], &device).unwrap(),
            source_mask: None,
            labels: Some(labels_from_targets(&target, config.pad_token_id).unwrap()),
            target_ids: target,
        };
        assert_eq!(batch.batch_size(), 1);
        assert!(batch.has_labels());
        let out = model.forward(&batch, false).unwrap();
        assert_eq!(out.logits.dims(), &[1, 4, config.vocab_size]);
        assert!(out.loss.is_some());
    }

    #[test]
    fn test_seq2seq_generation_needs_source() {
        let device = Device::Cpu;
        let model = ModelHead::seeded(seq2seq_tiny(), 0, &device).unwrap();
        assert!(model.logits_source(None).is_err());

        let config = GenerationConfig {
            max_new_tokens: 3,
            temperature: 0.0,
            eos_id: Some(31),
            ..GenerationConfig::default()
        };
        let mut generation = model.generate(Vec::new(), Some(&[4, 5, 6]), config).unwrap();
        assert_eq!(generation.tokens(), &[1]);
        let tokens = generation.collect_tokens().unwrap();
        assert!(tokens.len() <= 3);
    }

    #[test]
    fn test_tied_weights_exposed() {
        let device = Device::Cpu;
        let model = ModelHead::seeded(ModelConfig::tiny(), 0, &device).unwrap();
        assert_eq!(model.token_embedding().id(), model.lm_head_weight().id());
        assert!(model.as_decoder_only().is_some());
        assert!(model.as_encoder_decoder().is_none());
    }
}
