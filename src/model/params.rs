//! Trainable parameter storage.
//!
//! Every variable is created through a [`Scope`], which records whether the
//! optimizer should apply weight decay to it. The tag is fixed at construction
//! so optimizer grouping never has to guess from names or layer types.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use candle_core::{Device, Shape, Tensor, Var};
use candle_nn::{Embedding, Linear, VarMap};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::error::{ModelError, Result};

/// Standard deviation for linear and embedding weights.
pub const INIT_STD: f64 = 0.02;

/// Whether the optimizer applies decoupled weight decay to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightDecay {
    Apply,
    Skip,
}

/// Initial values for a new parameter.
#[derive(Debug, Clone, Copy)]
pub enum ParamInit {
    Normal { std: f64 },
    Zeros,
    Ones,
}

/// Owner of every trainable tensor of one model.
pub struct ParamStore {
    varmap: VarMap,
    decay: Mutex<BTreeMap<String, WeightDecay>>,
    rng: Mutex<StdRng>,
    device: Device,
}

fn poisoned() -> ModelError {
    candle_core::Error::Msg("parameter store lock poisoned".into()).into()
}

impl ParamStore {
    /// Create an empty store whose initial values come from OS entropy.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self::with_rng(StdRng::from_entropy(), device)
    }

    /// Create an empty store with reproducible initial values.
    #[must_use]
    pub fn seeded(seed: u64, device: &Device) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), device)
    }

    fn with_rng(rng: StdRng, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            decay: Mutex::new(BTreeMap::new()),
            rng: Mutex::new(rng),
            device: device.clone(),
        }
    }

    #[must_use]
    pub fn root(&self) -> Scope<'_> {
        Scope {
            store: self,
            prefix: String::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Underlying candle variable map.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn get_or_create(
        &self,
        path: &str,
        shape: Shape,
        init: ParamInit,
        decay: WeightDecay,
    ) -> Result<Tensor> {
        let mut data = self.varmap.data().lock().map_err(|_| poisoned())?;
        if let Some(existing) = data.get(path) {
            if existing.shape() != &shape {
                return Err(ModelError::shape(format!(
                    "parameter {path} already exists with shape {:?}, requested {shape:?}",
                    existing.shape()
                )));
            }
            return Ok(existing.as_tensor().clone());
        }

        let n = shape.elem_count();
        let values = match init {
            ParamInit::Zeros => vec![0.0f32; n],
            ParamInit::Ones => vec![1.0f32; n],
            ParamInit::Normal { std } => {
                let normal = Normal::new(0.0f32, std as f32)
                    .map_err(|e| ModelError::config(format!("invalid init std {std}: {e}")))?;
                let mut rng = self.rng.lock().map_err(|_| poisoned())?;
                (0..n).map(|_| normal.sample(&mut *rng)).collect()
            }
        };
        let tensor = Tensor::from_vec(values, shape, &self.device)?;
        let var = Var::from_tensor(&tensor)?;
        let out = var.as_tensor().clone();
        data.insert(path.to_string(), var);
        self.decay
            .lock()
            .map_err(|_| poisoned())?
            .insert(path.to_string(), decay);
        Ok(out)
    }

    /// All variables, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the store lock is poisoned.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self.varmap.data().lock().map_err(|_| poisoned())?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Weight-decay tag of a variable, if it exists.
    #[must_use]
    pub fn decay_of(&self, name: &str) -> Option<WeightDecay> {
        self.decay.lock().ok()?.get(name).copied()
    }

    /// Split variables into (decayed, not decayed) groups using the tags recorded at
    /// construction. The groups are disjoint and together cover every variable.
    ///
    /// # Errors
    /// Returns an error if a variable has no tag or the store lock is poisoned.
    pub fn partition(&self) -> Result<(Vec<(String, Var)>, Vec<(String, Var)>)> {
        let vars = self.named_vars()?;
        let tags = self.decay.lock().map_err(|_| poisoned())?;
        let mut decay = Vec::new();
        let mut no_decay = Vec::new();
        for (name, var) in vars {
            match tags.get(&name) {
                Some(WeightDecay::Apply) => decay.push((name, var)),
                Some(WeightDecay::Skip) => no_decay.push((name, var)),
                None => {
                    return Err(ModelError::config(format!(
                        "parameter {name} has no weight-decay tag"
                    )));
                }
            }
        }
        Ok((decay, no_decay))
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.named_vars()
            .map(|vars| vars.iter().map(|(_, v)| v.elem_count()).sum())
            .unwrap_or(0)
    }

    /// Write all parameters to a safetensors file.
    ///
    /// # Errors
    /// Returns an error if serialization or file I/O fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite all parameters in place from a safetensors file.
    ///
    /// Tensors already handed out (including tied ones) observe the new values.
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or has the wrong shape.
    pub fn load(&self, path: &Path) -> Result<()> {
        let mut varmap = self.varmap.clone();
        varmap.load(path)?;
        Ok(())
    }
}

/// A named position inside a [`ParamStore`], like a `VarBuilder` prefix.
#[derive(Clone)]
pub struct Scope<'a> {
    store: &'a ParamStore,
    prefix: String,
}

impl<'a> Scope<'a> {
    /// Push a path component.
    #[must_use]
    pub fn pp(&self, name: impl AsRef<str>) -> Scope<'a> {
        let name = name.as_ref();
        let prefix = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        };
        Scope {
            store: self.store,
            prefix,
        }
    }

    /// Fetch or create the parameter `name` under this scope.
    ///
    /// # Errors
    /// Returns an error if the parameter exists with a different shape.
    pub fn get(
        &self,
        shape: impl Into<Shape>,
        name: &str,
        init: ParamInit,
        decay: WeightDecay,
    ) -> Result<Tensor> {
        let path = self.pp(name).prefix;
        self.store.get_or_create(&path, shape.into(), init, decay)
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        self.store.device()
    }
}

/// Linear layer `in_dim -> out_dim`; weight decays, bias does not.
pub(crate) fn linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    scope: &Scope<'_>,
) -> Result<Linear> {
    let weight = scope.get(
        (out_dim, in_dim),
        "weight",
        ParamInit::Normal { std: INIT_STD },
        WeightDecay::Apply,
    )?;
    let bias = if bias {
        Some(scope.get(out_dim, "bias", ParamInit::Zeros, WeightDecay::Skip)?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Embedding table `[n, dim]`, never decayed.
pub(crate) fn embedding(n: usize, dim: usize, scope: &Scope<'_>) -> Result<Embedding> {
    let table = scope.get(
        (n, dim),
        "weight",
        ParamInit::Normal { std: INIT_STD },
        WeightDecay::Skip,
    )?;
    Ok(Embedding::new(table, dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_stores_match() {
        let device = Device::Cpu;
        let a = ParamStore::seeded(7, &device);
        let b = ParamStore::seeded(7, &device);
        let init = ParamInit::Normal { std: 1.0 };
        let ta = a.root().get((3, 4), "w", init, WeightDecay::Apply).unwrap();
        let tb = b.root().get((3, 4), "w", init, WeightDecay::Apply).unwrap();
        assert_eq!(ta.to_vec2::<f32>().unwrap(), tb.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_get_returns_same_variable() {
        let device = Device::Cpu;
        let store = ParamStore::seeded(0, &device);
        let scope = store.root().pp("layer");
        let first = scope.get(4, "bias", ParamInit::Zeros, WeightDecay::Skip).unwrap();
        let second = scope.get(4, "bias", ParamInit::Ones, WeightDecay::Skip).unwrap();
        assert_eq!(first.id(), second.id());
        assert!(matches!(
            scope.get(5, "bias", ParamInit::Zeros, WeightDecay::Skip),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_partition_follows_tags() {
        let device = Device::Cpu;
        let store = ParamStore::seeded(0, &device);
        let root = store.root();
        linear(4, 8, true, &root.pp("proj")).unwrap();
        embedding(10, 4, &root.pp("wte")).unwrap();

        let (decay, no_decay) = store.partition().unwrap();
        let decay: Vec<_> = decay.into_iter().map(|(n, _)| n).collect();
        let no_decay: Vec<_> = no_decay.into_iter().map(|(n, _)| n).collect();
        assert_eq!(decay, vec!["proj.weight".to_string()]);
        assert_eq!(
            no_decay,
            vec!["proj.bias".to_string(), "wte.weight".to_string()]
        );
        assert_eq!(store.num_parameters(), 4 * 8 + 8 + 10 * 4);
        assert_eq!(store.decay_of("proj.weight"), Some(WeightDecay::Apply));
    }
}
