//! Encoder-decoder model for source/target pairs.
//!
//! The encoder runs bidirectional self-attention over the source, masking only
//! padding. Each decoder block applies causal self-attention (AND target
//! padding) followed by cross-attention over the encoder output, where the
//! source padding is the only mask.

use candle_core::{Device, Tensor};
use candle_nn::{Dropout, Linear, Module};

use super::config::ModelConfig;
use super::embedding::TokenEmbedding;
use super::head::ModelOutput;
use super::layers::{BlockInputs, LayerNorm, TransformerBlock};
use super::loss::shifted_cross_entropy;
use super::mask::{
    causal_padding_mask, dims2, key_padding_mask, padding_mask, to_additive,
    validate_attention_mask,
};
use super::params::Scope;
use super::position::LearnedPositions;
use crate::error::{ModelError, Result};
use crate::inference::generate::LogitsSource;

/// Encoder output ready to be attended to by the decoder.
pub struct EncodedSource {
    /// Contextualized source states (batch, src_len, n_embd)
    pub hidden: Tensor,
    /// Additive source padding mask (batch, 1, 1, src_len)
    pub key_mask: Tensor,
}

impl EncodedSource {
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.hidden.dims().first().copied().unwrap_or(0)
    }
}

/// Transformer encoder-decoder with a shared, tied token embedding.
pub struct EncoderDecoder {
    wte: TokenEmbedding,
    enc_pos: LearnedPositions,
    dec_pos: LearnedPositions,
    drop: Dropout,
    encoder: Vec<TransformerBlock>,
    ln_enc: LayerNorm,
    decoder: Vec<TransformerBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: ModelConfig,
    device: Device,
}

impl EncoderDecoder {
    /// # Errors
    /// Returns [`ModelError::Configuration`] for invalid hyperparameters.
    pub fn new(config: &ModelConfig, scope: &Scope<'_>) -> Result<Self> {
        config.validate()?;
        let eps = config.layer_norm_eps;

        let wte = TokenEmbedding::new(config, &scope.pp("wte"))?;
        let encoder = (0..config.n_layer)
            .map(|i| TransformerBlock::new(config, false, &scope.pp(format!("encoder.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..config.n_layer)
            .map(|i| TransformerBlock::new(config, true, &scope.pp(format!("decoder.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let lm_head = wte.tied_head();

        Ok(Self {
            enc_pos: LearnedPositions::new(config, &scope.pp("enc_wpe"))?,
            dec_pos: LearnedPositions::new(config, &scope.pp("dec_wpe"))?,
            drop: Dropout::new(config.embd_pdrop),
            ln_enc: LayerNorm::new(config.n_embd, eps, &scope.pp("ln_enc"))?,
            ln_f: LayerNorm::new(config.n_embd, eps, &scope.pp("ln_f"))?,
            wte,
            encoder,
            decoder,
            lm_head,
            config: config.clone(),
            device: scope.device().clone(),
        })
    }

    fn check_len(&self, len: usize, what: &str) -> Result<()> {
        if len == 0 {
            return Err(ModelError::shape(format!("{what} must contain at least one position")));
        }
        if len > self.config.block_size {
            return Err(ModelError::config(format!(
                "{what} length {len} exceeds context window {}",
                self.config.block_size
            )));
        }
        Ok(())
    }

    fn embed(&self, ids: &Tensor, positions: &LearnedPositions, train: bool) -> Result<Tensor> {
        let (_, t) = ids.dims2()?;
        let x = self
            .wte
            .forward(ids)?
            .broadcast_add(&positions.forward(0, t, &self.device)?)?;
        Ok(self.drop.forward(&x, train)?)
    }

    /// Run the encoder over `source_ids` (batch, src_len).
    ///
    /// Without an explicit `source_mask` the padding mask is derived from
    /// `pad_token_id`.
    ///
    /// # Errors
    /// Returns [`ModelError::Shape`] for a malformed mask and
    /// [`ModelError::Configuration`] if the source is longer than the context window.
    pub fn encode(
        &self,
        source_ids: &Tensor,
        source_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<EncodedSource> {
        let (b, s) = dims2(source_ids, "source ids")?;
        self.check_len(s, "source")?;
        log::debug!("encode: batch={b} src_len={s} train={train}");

        let keep = match source_mask {
            Some(mask) => {
                validate_attention_mask(source_ids, mask)?;
                mask.clone()
            }
            None => padding_mask(source_ids, self.config.pad_token_id)?,
        };
        let key_mask = to_additive(&key_padding_mask(&keep)?)?;

        let mut x = self.embed(source_ids, &self.enc_pos, train)?;
        let inputs = BlockInputs {
            self_mask: Some(&key_mask),
            train,
            ..BlockInputs::default()
        };
        for block in &self.encoder {
            x = block.forward(&x, &inputs)?;
        }
        Ok(EncodedSource {
            hidden: self.ln_enc.forward(&x)?,
            key_mask,
        })
    }

    /// Run the decoder over `target_ids` (batch, tgt_len) attending to `encoded`.
    ///
    /// # Errors
    /// Returns [`ModelError::Shape`] when the batch sizes or label shape
    /// disagree and [`ModelError::Configuration`] if the target is too long.
    pub fn decode(
        &self,
        target_ids: &Tensor,
        encoded: &EncodedSource,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<ModelOutput> {
        let (b, t) = dims2(target_ids, "target ids")?;
        self.check_len(t, "target")?;
        if b != encoded.batch_size() {
            return Err(ModelError::shape(format!(
                "target batch {b} does not match encoded batch {}",
                encoded.batch_size()
            )));
        }

        let keep = padding_mask(target_ids, self.config.pad_token_id)?;
        let self_mask = to_additive(&causal_padding_mask(&keep, self.config.block_size)?)?;

        let mut x = self.embed(target_ids, &self.dec_pos, train)?;
        let inputs = BlockInputs {
            self_mask: Some(&self_mask),
            position_bias: None,
            memory: Some(&encoded.hidden),
            memory_mask: Some(&encoded.key_mask),
            train,
        };
        for block in &self.decoder {
            x = block.forward(&x, &inputs)?;
        }
        let x = self.ln_f.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;

        let loss = match labels {
            Some(labels) => {
                if labels.dims() != target_ids.dims() {
                    return Err(ModelError::shape(format!(
                        "labels {:?} must match target ids {:?}",
                        labels.dims(),
                        target_ids.dims()
                    )));
                }
                Some(shifted_cross_entropy(&logits, labels)?)
            }
            None => None,
        };
        Ok(ModelOutput { logits, loss })
    }

    /// Encode then decode in one call.
    ///
    /// # Errors
    /// See [`EncoderDecoder::encode`] and [`EncoderDecoder::decode`].
    pub fn forward(
        &self,
        source_ids: &Tensor,
        source_mask: Option<&Tensor>,
        target_ids: &Tensor,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<ModelOutput> {
        let encoded = self.encode(source_ids, source_mask, train)?;
        self.decode(target_ids, &encoded, labels, train)
    }

    /// Encode a single source sequence for generation.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn condition(&self, source: &[u32]) -> Result<ConditionedDecoder<'_>> {
        let ids = Tensor::new(source, &self.device)?.unsqueeze(0)?;
        Ok(ConditionedDecoder {
            model: self,
            encoded: self.encode(&ids, None, false)?,
        })
    }

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

/// Decoder bound to one encoded source; target prompts start with `sos`.
pub struct ConditionedDecoder<'a> {
    model: &'a EncoderDecoder,
    encoded: EncodedSource,
}

impl ConditionedDecoder<'_> {
    #[must_use]
    pub fn encoded(&self) -> &EncodedSource {
        &self.encoded
    }
}

impl LogitsSource for ConditionedDecoder<'_> {
    fn context_window(&self) -> usize {
        self.model.config.block_size
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let target = Tensor::new(tokens, &self.model.device)?.unsqueeze(0)?;
        let logits = self.model.decode(&target, &self.encoded, None, false)?.logits;
        let (_, t, _) = logits.dims3()?;
        Ok(logits.narrow(1, t - 1, 1)?.flatten_all()?.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::Architecture;
    use crate::model::loss::labels_from_targets;
    use crate::model::params::ParamStore;

    fn tiny_seq2seq() -> ModelConfig {
        ModelConfig {
            architecture: Architecture::EncoderDecoder,
            ..ModelConfig::tiny()
        }
    }

    #[test]
    fn test_forward_shapes_and_loss() {
        let device = Device::Cpu;
        let config = tiny_seq2seq();
        let store = ParamStore::seeded(0, &device);
        let model = EncoderDecoder::new(&config, &store.root()).unwrap();

        let source = Tensor::new(&[[4u32, 5, 6, 0], [7, 8, 0, 0]], &device).unwrap();
        let target = Tensor::new(&[[1u32, 9, 10, 0, 0], [1, 11, 12, 13, 0]], &device).unwrap();
        let labels = labels_from_targets(&target, config.pad_token_id).unwrap();

        let out = model.forward(&source, None, &target, Some(&labels), false).unwrap();
        assert_eq!(out.logits.dims(), &[2, 5, config.vocab_size]);
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss >= 0.0);
    }

    #[test]
    fn test_source_padding_is_ignored() {
        let device = Device::Cpu;
        let config = tiny_seq2seq();
        let store = ParamStore::seeded(5, &device);
        let model = EncoderDecoder::new(&config, &store.root()).unwrap();

        let target = Tensor::new(&[[1u32, 9]], &device).unwrap();
        let short = Tensor::new(&[[4u32, 5, 6]], &device).unwrap();
        let padded = Tensor::new(&[[4u32, 5, 6, 0, 0]], &device).unwrap();

        let a = model.forward(&short, None, &target, None, false).unwrap().logits;
        let b = model.forward(&padded, None, &target, None, false).unwrap().logits;
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_batch_mismatch_between_encoder_and_decoder() {
        let device = Device::Cpu;
        let config = tiny_seq2seq();
        let store = ParamStore::seeded(0, &device);
        let model = EncoderDecoder::new(&config, &store.root()).unwrap();

        let source = Tensor::new(&[[4u32, 5]], &device).unwrap();
        let encoded = model.encode(&source, None, false).unwrap();
        let target = Tensor::new(&[[1u32, 2], [1, 3]], &device).unwrap();
        assert!(matches!(
            model.decode(&target, &encoded, None, false),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_explicit_source_mask_is_validated() {
        let device = Device::Cpu;
        let config = tiny_seq2seq();
        let store = ParamStore::seeded(0, &device);
        let model = EncoderDecoder::new(&config, &store.root()).unwrap();

        let source = Tensor::new(&[[4u32, 5, 6]], &device).unwrap();
        let bad = Tensor::new(&[[1u8, 1]], &device).unwrap();
        assert!(matches!(
            model.encode(&source, Some(&bad), false),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_conditioned_decoder_logits() {
        let device = Device::Cpu;
        let config = tiny_seq2seq();
        let store = ParamStore::seeded(0, &device);
        let model = EncoderDecoder::new(&config, &store.root()).unwrap();

        let cond = model.condition(&[4, 5, 6]).unwrap();
        assert_eq!(cond.encoded().batch_size(), 1);
        let logits = cond.next_token_logits(&[config.sos_token_id, 7]).unwrap();
        assert_eq!(logits.len(), config.vocab_size);
        assert_eq!(cond.context_window(), config.block_size);
    }

    #[test]
    fn test_embedding_and_head_are_tied() {
        let device = Device::Cpu;
        let config = tiny_seq2seq();
        let store = ParamStore::seeded(0, &device);
        let model = EncoderDecoder::new(&config, &store.root()).unwrap();
        assert_eq!(model.token_embedding().id(), model.lm_head_weight().id());
    }
}
