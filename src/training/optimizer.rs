//! AdamW with decoupled weight decay over candle variables.
//!
//! Parameters are split into two groups by the [`WeightDecay`] tag recorded
//! when they were created. Moment buffers are plain tensors keyed by parameter
//! name so they can be written to and restored from a checkpoint.
//!
//! ```text
//! θ = θ * (1 - lr * λ)              # decay group only
//! m = β₁ * m + (1 - β₁) * g
//! v = β₂ * v + (1 - β₂) * g²
//! θ = θ - lr * m̂ / (√v̂ + ε)         # m̂, v̂ bias-corrected
//! ```

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::model::params::{ParamStore, WeightDecay};

/// Optimizer hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Applied to the decay group only
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    decay: WeightDecay,
    m: Tensor,
    v: Tensor,
}

/// AdamW optimizer state.
pub struct AdamW {
    params: Vec<ParamState>,
    config: AdamWConfig,
    step: usize,
}

impl AdamW {
    /// Track every variable of `store`, grouped by its decay tag.
    ///
    /// # Errors
    /// Returns an error if a variable carries no decay tag.
    pub fn new(store: &ParamStore, config: AdamWConfig) -> Result<Self> {
        let (decay, no_decay) = store.partition()?;
        log::debug!(
            "adamw groups: {} decayed, {} not decayed",
            decay.len(),
            no_decay.len()
        );

        let tagged = decay
            .into_iter()
            .map(|p| (p, WeightDecay::Apply))
            .chain(no_decay.into_iter().map(|p| (p, WeightDecay::Skip)));
        let mut params = Vec::new();
        for ((name, var), decay) in tagged {
            let m = var.as_tensor().zeros_like()?;
            let v = var.as_tensor().zeros_like()?;
            params.push(ParamState {
                name,
                var,
                decay,
                m,
                v,
            });
        }
        params.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            params,
            config,
            step: 0,
        })
    }

    /// Apply one update from `grads`. Parameters without a gradient are left untouched.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let t = self.step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for p in &mut self.params {
            let Some(g) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let m = ((&p.m * beta1)? + (g * (1.0 - beta1))?)?;
            let v = ((&p.v * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;

            let mut theta = p.var.as_tensor().detach();
            if p.decay == WeightDecay::Apply && weight_decay > 0.0 {
                theta = (theta * (1.0 - lr * weight_decay))?;
            }
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let theta = (theta - (update * lr)?)?;
            p.var.set(&theta)?;

            p.m = m;
            p.v = v;
        }
        Ok(())
    }

    /// Backpropagate `loss` and apply one update.
    ///
    /// # Errors
    /// Returns an error if backpropagation or the update fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    #[must_use]
    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Number of updates applied so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Names of the parameters in each group: `(decayed, not decayed)`.
    #[must_use]
    pub fn groups(&self) -> (Vec<&str>, Vec<&str>) {
        let (decay, skip): (Vec<_>, Vec<_>) = self
            .params
            .iter()
            .partition(|p| p.decay == WeightDecay::Apply);
        (
            decay.iter().map(|p| p.name.as_str()).collect(),
            skip.iter().map(|p| p.name.as_str()).collect(),
        )
    }

    /// Moment buffers as `m.<param>` / `v.<param>` tensors.
    #[must_use]
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(self.params.len() * 2);
        for p in &self.params {
            out.insert(format!("m.{}", p.name), p.m.clone());
            out.insert(format!("v.{}", p.name), p.v.clone());
        }
        out
    }

    /// Names [`AdamW::state_tensors`] produces.
    #[must_use]
    pub fn state_names(&self) -> Vec<String> {
        self.params
            .iter()
            .flat_map(|p| [format!("m.{}", p.name), format!("v.{}", p.name)])
            .collect()
    }

    /// Restore moment buffers and the step counter.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] if a buffer is missing and
    /// [`ModelError::Shape`] if one has the wrong shape.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>, step: usize) -> Result<()> {
        for p in &mut self.params {
            let fetch = |key: String| -> Result<Tensor> {
                let t = tensors.get(&key).ok_or_else(|| {
                    ModelError::config(format!("optimizer state {key} missing"))
                })?;
                if t.dims() != p.var.as_tensor().dims() {
                    return Err(ModelError::shape(format!(
                        "optimizer state {key} has shape {:?}, parameter has {:?}",
                        t.dims(),
                        p.var.as_tensor().dims()
                    )));
                }
                Ok(t.to_device(p.var.as_tensor().device())?)
            };
            let m = fetch(format!("m.{}", p.name))?;
            let v = fetch(format!("v.{}", p.name))?;
            p.m = m;
            p.v = v;
        }
        self.step = step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ModelHead};
    use candle_core::{DType, Device};

    fn tiny_model(seed: u64) -> ModelHead {
        ModelHead::seeded(ModelConfig::tiny(), seed, &Device::Cpu).unwrap()
    }

    fn batch(device: &Device) -> crate::model::Batch {
        let ids = Tensor::new(&[[2u32, 5, 7, 9, 11, 13]], device).unwrap();
        crate::model::Batch::Causal {
            input_ids: ids.clone(),
            attention_mask: None,
            labels: Some(ids),
        }
    }

    #[test]
    fn test_groups_follow_tags() {
        let model = tiny_model(0);
        let opt = AdamW::new(model.params(), AdamWConfig::default()).unwrap();
        let (decay, skip) = opt.groups();
        assert!(decay.iter().all(|n| n.ends_with("weight") && !n.contains("ln")));
        assert!(skip.iter().any(|n| n.ends_with("bias")));
        assert!(skip.contains(&"wte.weight"));
        assert_eq!(decay.len() + skip.len(), model.params().named_vars().unwrap().len());
    }

    #[test]
    fn test_training_reduces_loss() {
        let device = Device::Cpu;
        let model = tiny_model(1);
        let mut opt = AdamW::new(
            model.params(),
            AdamWConfig {
                lr: 1e-2,
                ..AdamWConfig::default()
            },
        )
        .unwrap();
        let batch = batch(&device);

        let loss_of = |m: &ModelHead| {
            m.forward(&batch, false)
                .unwrap()
                .loss
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        };
        let before = loss_of(&model);
        for _ in 0..20 {
            let loss = model.forward(&batch, true).unwrap().loss.unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let after = loss_of(&model);
        assert!(after < before, "loss should drop: {before} -> {after}");
        assert_eq!(opt.step_count(), 20);
    }

    #[test]
    fn test_weight_tying_survives_step() {
        let device = Device::Cpu;
        let model = tiny_model(2);
        let mut opt = AdamW::new(model.params(), AdamWConfig::default()).unwrap();
        let before: Vec<f32> = model.token_embedding().flatten_all().unwrap().to_vec1().unwrap();

        let loss = model.forward(&batch(&device), true).unwrap().loss.unwrap();
        opt.backward_step(&loss).unwrap();

        let wte: Vec<f32> = model.token_embedding().flatten_all().unwrap().to_vec1().unwrap();
        let head: Vec<f32> = model.lm_head_weight().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(wte, head);
        assert_ne!(wte, before);
    }

    #[test]
    fn test_state_roundtrip_and_validation() {
        let device = Device::Cpu;
        let model = tiny_model(3);
        let mut opt = AdamW::new(model.params(), AdamWConfig::default()).unwrap();
        let loss = model.forward(&batch(&device), true).unwrap().loss.unwrap();
        opt.backward_step(&loss).unwrap();

        let state = opt.state_tensors();
        assert_eq!(state.len(), opt.state_names().len());

        let mut fresh = AdamW::new(model.params(), AdamWConfig::default()).unwrap();
        fresh.load_state(&state, opt.step_count()).unwrap();
        assert_eq!(fresh.step_count(), 1);
        let a: Vec<f32> = state["m.wte.weight"].flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = fresh.state_tensors()["m.wte.weight"]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);

        let mut broken = state.clone();
        broken.insert(
            "v.ln_f.weight".into(),
            Tensor::zeros(3, DType::F32, &device).unwrap(),
        );
        assert!(matches!(
            fresh.load_state(&broken, 1),
            Err(ModelError::Shape(_))
        ));
        broken.remove("v.ln_f.weight");
        assert!(matches!(
            fresh.load_state(&broken, 1),
            Err(ModelError::Configuration(_))
        ));
    }
}
