//! Training checkpoints.
//!
//! A checkpoint is a directory:
//! - `model.safetensors` - every model parameter by name
//! - `optimizer.safetensors` - AdamW moment buffers (`m.<param>`, `v.<param>`)
//! - `checkpoint.json` - epoch, global step, model config and optimizer settings
//!
//! Loading checks that the weight files hold every expected tensor before
//! anything is overwritten.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use super::optimizer::{AdamW, AdamWConfig};
use crate::model::{ModelConfig, ModelHead, ParamStore};

pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const META_FILE: &str = "checkpoint.json";

/// Everything in a checkpoint except tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Number of completed epochs
    pub epoch: usize,
    pub global_step: usize,
    pub config: ModelConfig,
    pub optimizer: AdamWConfig,
    /// AdamW update count, used for bias correction
    pub optimizer_step: usize,
}

/// Write a checkpoint into `dir`.
///
/// Files are written to a sibling staging directory which then replaces
/// `dir`, so a crash mid-save never mixes files from two checkpoints.
///
/// # Errors
/// Returns an error if any file cannot be written.
pub fn save(
    dir: &Path,
    model: &ModelHead,
    optimizer: &AdamW,
    epoch: usize,
    global_step: usize,
) -> Result<()> {
    let staging = sibling(dir, "partial")?;
    let previous = sibling(dir, "previous")?;
    if !dir.exists() && previous.join(META_FILE).exists() {
        fs::rename(&previous, dir).context("recover interrupted checkpoint swap")?;
    }
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("remove stale {}", staging.display()))?;
    }
    fs::create_dir_all(&staging).with_context(|| format!("create {}", staging.display()))?;

    model
        .params()
        .save(&staging.join(MODEL_FILE))
        .context("save model weights")?;
    candle_core::safetensors::save(&optimizer.state_tensors(), staging.join(OPTIMIZER_FILE))
        .context("save optimizer state")?;

    let meta = CheckpointMeta {
        epoch,
        global_step,
        config: model.config().clone(),
        optimizer: *optimizer.config(),
        optimizer_step: optimizer.step_count(),
    };
    let path = staging.join(META_FILE);
    let mut writer =
        BufWriter::new(File::create(&path).with_context(|| format!("create {}", path.display()))?);
    serde_json::to_writer_pretty(&mut writer, &meta).context("write checkpoint.json")?;
    writer.flush().context("flush checkpoint.json")?;

    if dir.exists() {
        if previous.exists() {
            fs::remove_dir_all(&previous)
                .with_context(|| format!("remove {}", previous.display()))?;
        }
        fs::rename(dir, &previous).with_context(|| format!("move aside {}", dir.display()))?;
    }
    fs::rename(&staging, dir).with_context(|| format!("move {} into place", staging.display()))?;
    if previous.exists() {
        fs::remove_dir_all(&previous).with_context(|| format!("remove {}", previous.display()))?;
    }

    log::info!(
        "saved checkpoint to {} (epoch {epoch}, step {global_step})",
        dir.display()
    );
    Ok(())
}

/// Whether `dir` (or the copy left by an interrupted save) holds a checkpoint.
#[must_use]
pub fn exists(dir: &Path) -> bool {
    resolve(dir).join(META_FILE).exists()
}

/// `<dir>.<suffix>` next to `dir`.
fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .with_context(|| format!("checkpoint path {} has no directory name", dir.display()))?;
    let mut name = name.to_os_string();
    name.push(format!(".{suffix}"));
    Ok(dir.with_file_name(name))
}

/// The directory to read from: `dir`, or the previous checkpoint if a save
/// was interrupted between moving it aside and moving the new one in.
fn resolve(dir: &Path) -> PathBuf {
    if !dir.join(META_FILE).exists() {
        if let Ok(previous) = sibling(dir, "previous") {
            if previous.join(META_FILE).exists() {
                log::warn!(
                    "{} is incomplete, reading {}",
                    dir.display(),
                    previous.display()
                );
                return previous;
            }
        }
    }
    dir.to_path_buf()
}

/// Read `checkpoint.json` from `dir`.
///
/// # Errors
/// Returns an error if the file is missing or malformed.
pub fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
    let path = resolve(dir).join(META_FILE);
    let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let meta: CheckpointMeta = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse {}", path.display()))?;
    meta.config
        .validate()
        .context("invalid model config in checkpoint")?;
    Ok(meta)
}

/// Fail unless the safetensors file at `path` contains every name in `expected`.
///
/// # Errors
/// Returns an error naming the first missing tensor.
pub fn verify_tensor_names(path: &Path, expected: &[String]) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("parse safetensors {}", path.display()))?;
    let present = tensors.names();
    for name in expected {
        if !present.iter().any(|n| *n == name) {
            anyhow::bail!("{} is missing tensor {name:?}", path.display());
        }
    }
    Ok(())
}

/// Rebuild the model stored in `dir`.
///
/// # Errors
/// Returns an error if the metadata or weights are missing or inconsistent.
pub fn load_model(dir: &Path, device: &Device) -> Result<(ModelHead, CheckpointMeta)> {
    let meta = read_meta(dir)?;
    let model = ModelHead::new(meta.config.clone(), ParamStore::new(device))
        .context("build model from checkpoint config")?;

    let weights = resolve(dir).join(MODEL_FILE);
    let expected: Vec<String> = model
        .params()
        .named_vars()?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    verify_tensor_names(&weights, &expected)?;
    model
        .params()
        .load(&weights)
        .with_context(|| format!("load {}", weights.display()))?;

    log::info!(
        "loaded checkpoint {} (epoch {}, step {})",
        dir.display(),
        meta.epoch,
        meta.global_step
    );
    Ok((model, meta))
}

/// Rebuild an optimizer for `model` with the state stored in `dir`.
///
/// # Errors
/// Returns an error if the optimizer file is missing or does not match the model.
pub fn load_optimizer(dir: &Path, model: &ModelHead, meta: &CheckpointMeta) -> Result<AdamW> {
    let mut optimizer = AdamW::new(model.params(), meta.optimizer)?;
    let path = resolve(dir).join(OPTIMIZER_FILE);
    verify_tensor_names(&path, &optimizer.state_names())?;
    let tensors = candle_core::safetensors::load(&path, model.device())
        .with_context(|| format!("load {}", path.display()))?;
    optimizer.load_state(&tensors, meta.optimizer_step)?;
    Ok(optimizer)
}
