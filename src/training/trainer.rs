//! Epoch loop: forward with labels, backward, AdamW step, periodic sampling
//! and a checkpoint at every epoch boundary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;

use super::checkpoint;
use super::monitor::MonitorSink;
use super::optimizer::{AdamW, AdamWConfig};
use crate::error::ModelError;
use crate::inference::GenerationConfig;
use crate::model::{Batch, ModelHead};
use crate::tokenizer::Tokenizer;

/// Trainer settings.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    /// Emit metrics and a sample every this many steps; `0` disables it
    pub sample_every: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub monitor: Option<MonitorPrompt>,
    pub generation: GenerationConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            sample_every: 50,
            checkpoint_dir: None,
            monitor: None,
            generation: GenerationConfig {
                max_new_tokens: 20,
                ..GenerationConfig::default()
            },
        }
    }
}

/// Prompt completed during training to eyeball progress.
#[derive(Debug, Clone)]
pub struct MonitorPrompt {
    pub text: String,
    /// Decoder prompt ids (decoder-only) or `[sos]` (encoder-decoder)
    pub prompt: Vec<u32>,
    /// Encoder input for encoder-decoder models
    pub source: Option<Vec<u32>>,
}

impl MonitorPrompt {
    /// Build a monitoring prompt for `model` from text.
    ///
    /// # Errors
    /// Returns an error if the tokenizer fails.
    pub fn encode(text: &str, model: &ModelHead, tokenizer: &dyn Tokenizer) -> crate::Result<Self> {
        let ids = tokenizer.encode(text)?;
        Ok(match model.as_encoder_decoder() {
            Some(_) => Self {
                text: text.to_string(),
                prompt: vec![tokenizer.sos_id()],
                source: Some(ids),
            },
            None => {
                let mut prompt = vec![tokenizer.sos_id()];
                prompt.extend(ids);
                Self {
                    text: text.to_string(),
                    prompt,
                    source: None,
                }
            }
        })
    }
}

/// Result of one epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochSummary {
    /// Epoch index, starting at 0
    pub epoch: usize,
    pub steps: usize,
    pub avg_loss: f64,
}

/// Owns the model and its optimizer for the duration of training.
pub struct Trainer<'t> {
    model: ModelHead,
    optimizer: AdamW,
    config: TrainerConfig,
    tokenizer: Option<&'t dyn Tokenizer>,
    epoch: usize,
    global_step: usize,
}

impl<'t> Trainer<'t> {
    /// Start training a fresh model.
    ///
    /// # Errors
    /// Returns an error if the optimizer cannot group the parameters.
    pub fn new(model: ModelHead, optimizer: AdamWConfig, config: TrainerConfig) -> crate::Result<Self> {
        let optimizer = AdamW::new(model.params(), optimizer)?;
        Ok(Self {
            model,
            optimizer,
            config,
            tokenizer: None,
            epoch: 0,
            global_step: 0,
        })
    }

    /// Continue from the checkpoint in `dir` at its recorded epoch and step.
    ///
    /// # Errors
    /// Returns an error if the checkpoint cannot be restored.
    pub fn resume(dir: &Path, device: &Device, config: TrainerConfig) -> Result<Self> {
        let (model, meta) = checkpoint::load_model(dir, device)?;
        let optimizer = checkpoint::load_optimizer(dir, &model, &meta)?;
        Ok(Self {
            model,
            optimizer,
            config,
            tokenizer: None,
            epoch: meta.epoch,
            global_step: meta.global_step,
        })
    }

    /// Decode monitoring samples with `tokenizer`.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: &'t dyn Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Replace the prompt completed at every sampling step.
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorPrompt) -> Self {
        self.config.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn model(&self) -> &ModelHead {
        &self.model
    }

    #[must_use]
    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// Completed epochs.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    #[must_use]
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// One optimization step on `batch`; returns its loss.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] if the batch has no labels, plus
    /// any forward or backward error.
    pub fn train_step(&mut self, batch: &Batch) -> crate::Result<f32> {
        if !batch.has_labels() {
            return Err(ModelError::config("training batches need labels"));
        }
        let loss = self
            .model
            .forward(batch, true)?
            .loss
            .ok_or_else(|| ModelError::config("model returned no loss"))?;
        self.optimizer.backward_step(&loss)?;
        self.global_step += 1;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Complete the monitoring prompt. Failures are reported, never fatal.
    fn sample(&self) -> Option<(String, String)> {
        let monitor = self.config.monitor.as_ref()?;
        let run = || -> crate::Result<Vec<u32>> {
            let mut generation = self.model.generate(
                monitor.prompt.clone(),
                monitor.source.as_deref(),
                self.config.generation.clone(),
            )?;
            generation.collect_tokens()
        };
        let answer = match run() {
            Ok(tokens) => match self.tokenizer {
                Some(tok) => tok.decode(&tokens).unwrap_or_else(|e| format!("<decode error: {e}>")),
                None => format!("{tokens:?}"),
            },
            Err(e) => {
                log::warn!("monitor sample failed: {e}");
                "error".to_string()
            }
        };
        Some((monitor.text.clone(), answer))
    }

    /// Train over `batches` once, then checkpoint.
    ///
    /// # Errors
    /// Returns an error if a step, a sink or the checkpoint fails.
    pub fn run_epoch(&mut self, batches: &[Batch], sink: &mut dyn MonitorSink) -> Result<EpochSummary> {
        let epoch = self.epoch;
        let mut loss_sum = 0.0_f64;
        for (i, batch) in batches.iter().enumerate() {
            let loss = f64::from(
                self.train_step(batch)
                    .with_context(|| format!("epoch {epoch} step {}", self.global_step))?,
            );
            loss_sum += loss;
            #[allow(clippy::cast_precision_loss)]
            let avg = loss_sum / (i + 1) as f64;
            log::debug!("epoch {epoch} batch {i}: loss {loss:.4} avg {avg:.4}");

            if self.config.sample_every > 0 && (i + 1) % self.config.sample_every == 0 {
                let step = self.global_step;
                sink.scalar("train/loss", loss, step)?;
                sink.scalar("train/avg-loss", avg, step)?;
                if let Some((context, answer)) = self.sample() {
                    sink.text("train/context", &context, step)?;
                    sink.text("train/generated", &answer, step)?;
                }
            }
        }
        sink.flush()?;

        self.epoch += 1;
        if let Some(dir) = &self.config.checkpoint_dir {
            checkpoint::save(dir, &self.model, &self.optimizer, self.epoch, self.global_step)?;
        }

        #[allow(clippy::cast_precision_loss)]
        let avg_loss = if batches.is_empty() {
            0.0
        } else {
            loss_sum / batches.len() as f64
        };
        log::info!(
            "epoch {}/{} done: {} steps, avg loss {avg_loss:.4}",
            self.epoch,
            self.config.epochs,
            batches.len()
        );
        Ok(EpochSummary {
            epoch,
            steps: batches.len(),
            avg_loss,
        })
    }

    /// Run the remaining epochs. `batches_for` builds the batches of an epoch
    /// from its index, so shuffling can differ per epoch.
    ///
    /// # Errors
    /// Returns an error if any epoch fails.
    pub fn fit<F>(&mut self, mut batches_for: F, sink: &mut dyn MonitorSink) -> Result<Vec<EpochSummary>>
    where
        F: FnMut(usize) -> crate::Result<Vec<Batch>>,
    {
        let mut summaries = Vec::new();
        while self.epoch < self.config.epochs {
            let batches = batches_for(self.epoch).context("build epoch batches")?;
            summaries.push(self.run_epoch(&batches, sink)?);
        }
        Ok(summaries)
    }
}
