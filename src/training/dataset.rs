//! In-memory datasets that produce padded [`Batch`]es.
//!
//! Sources are local files:
//! - `.txt`: the whole file is one document
//! - `.jsonl`: one object per line, `{"text": ...}` for language modelling or
//!   `{"source": ..., "target": ...}` for sequence-to-sequence pairs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::model::{Batch, IGNORE_INDEX};
use crate::tokenizer::Tokenizer;

#[derive(Deserialize)]
struct TextRecord {
    text: String,
}

#[derive(Deserialize)]
struct PairRecord {
    source: String,
    target: String,
}

fn jsonl_records<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), i + 1))
        })
        .collect()
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or_default()
}

/// Load documents from a `.txt` or `.jsonl` file.
///
/// # Errors
/// Returns an error for unreadable files or unsupported extensions.
pub fn load_texts(path: &Path) -> Result<Vec<String>> {
    match extension(path) {
        "txt" => Ok(vec![
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        ]),
        "jsonl" => Ok(jsonl_records::<TextRecord>(path)?
            .into_iter()
            .map(|r| r.text)
            .collect()),
        other => bail!(
            "unsupported data source {} (extension {other:?}); expected .txt or .jsonl",
            path.display()
        ),
    }
}

/// Load `(source, target)` pairs from a `.jsonl` file.
///
/// # Errors
/// Returns an error for unreadable files or unsupported extensions.
pub fn load_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    if extension(path) != "jsonl" {
        bail!("pair data must be .jsonl, got {}", path.display());
    }
    Ok(jsonl_records::<PairRecord>(path)?
        .into_iter()
        .map(|r| (r.source, r.target))
        .collect())
}

fn shuffled_order(len: usize, seed: Option<u64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Some(seed) = seed {
        order.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    order
}

/// Pad every row to `width`; returns ids, keep flags and labels.
fn pad_rows(rows: &[&[u32]], width: usize, pad_id: u32) -> (Vec<u32>, Vec<u8>, Vec<i64>) {
    let mut ids = Vec::with_capacity(rows.len() * width);
    let mut keep = Vec::with_capacity(rows.len() * width);
    let mut labels = Vec::with_capacity(rows.len() * width);
    for row in rows {
        for i in 0..width {
            match row.get(i) {
                Some(&t) => {
                    ids.push(t);
                    keep.push(1);
                    labels.push(i64::from(t));
                }
                None => {
                    ids.push(pad_id);
                    keep.push(0);
                    labels.push(IGNORE_INDEX);
                }
            }
        }
    }
    (ids, keep, labels)
}

/// Token stream cut into fixed windows for causal language modelling.
pub struct TextDataset {
    windows: Vec<Vec<u32>>,
    block_size: usize,
    pad_id: u32,
}

impl TextDataset {
    /// Cut `tokens` into consecutive windows of `block_size`. A trailing
    /// window shorter than two tokens carries no training signal and is dropped.
    #[must_use]
    pub fn from_tokens(tokens: &[u32], block_size: usize, pad_id: u32) -> Self {
        let windows = tokens
            .chunks(block_size.max(1))
            .filter(|w| w.len() >= 2)
            .map(<[u32]>::to_vec)
            .collect();
        Self {
            windows,
            block_size,
            pad_id,
        }
    }

    /// Encode each document as `<sos> text <eos>` and concatenate them.
    ///
    /// # Errors
    /// Returns an error if the tokenizer fails.
    pub fn from_texts(
        texts: &[String],
        tokenizer: &dyn Tokenizer,
        block_size: usize,
    ) -> crate::Result<Self> {
        let mut stream = Vec::new();
        for text in texts {
            stream.push(tokenizer.sos_id());
            stream.extend(tokenizer.encode(text)?);
            stream.push(tokenizer.eos_id());
        }
        Ok(Self::from_tokens(&stream, block_size, tokenizer.pad_id()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Group windows into batches, optionally shuffled with `seed`.
    ///
    /// Labels equal the inputs with padding replaced by [`IGNORE_INDEX`].
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn batches(
        &self,
        batch_size: usize,
        seed: Option<u64>,
        device: &Device,
    ) -> crate::Result<Vec<Batch>> {
        let order = shuffled_order(self.windows.len(), seed);
        let mut out = Vec::new();
        for chunk in order.chunks(batch_size.max(1)) {
            let rows: Vec<&[u32]> = chunk.iter().map(|&i| self.windows[i].as_slice()).collect();
            let (ids, keep, labels) = pad_rows(&rows, self.block_size, self.pad_id);
            let shape = (rows.len(), self.block_size);
            out.push(Batch::Causal {
                input_ids: Tensor::from_vec(ids, shape, device)?,
                attention_mask: Some(Tensor::from_vec(keep, shape, device)?),
                labels: Some(Tensor::from_vec(labels, shape, device)?),
            });
        }
        Ok(out)
    }
}

/// Source/target pairs for the encoder-decoder model.
pub struct PairDataset {
    pairs: Vec<(Vec<u32>, Vec<u32>)>,
    max_len: usize,
    pad_id: u32,
}

impl PairDataset {
    /// Source is the encoded text, target is `<sos> text <eos>`; both are
    /// truncated to `max_len`.
    ///
    /// # Errors
    /// Returns an error if the tokenizer fails.
    pub fn from_pairs(
        pairs: &[(String, String)],
        tokenizer: &dyn Tokenizer,
        max_len: usize,
    ) -> crate::Result<Self> {
        let mut encoded = Vec::with_capacity(pairs.len());
        for (source, target) in pairs {
            let mut src = tokenizer.encode(source)?;
            src.truncate(max_len);
            if src.is_empty() {
                src.push(tokenizer.pad_id());
            }
            let mut tgt = vec![tokenizer.sos_id()];
            tgt.extend(tokenizer.encode(target)?);
            tgt.push(tokenizer.eos_id());
            tgt.truncate(max_len);
            encoded.push((src, tgt));
        }
        Ok(Self {
            pairs: encoded,
            max_len,
            pad_id: tokenizer.pad_id(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Batches padded to `max_len` with explicit source masks and target labels.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn batches(
        &self,
        batch_size: usize,
        seed: Option<u64>,
        device: &Device,
    ) -> crate::Result<Vec<Batch>> {
        let order = shuffled_order(self.pairs.len(), seed);
        let mut out = Vec::new();
        for chunk in order.chunks(batch_size.max(1)) {
            let sources: Vec<&[u32]> = chunk.iter().map(|&i| self.pairs[i].0.as_slice()).collect();
            let targets: Vec<&[u32]> = chunk.iter().map(|&i| self.pairs[i].1.as_slice()).collect();
            let (src_ids, src_keep, _) = pad_rows(&sources, self.max_len, self.pad_id);
            let (tgt_ids, _, labels) = pad_rows(&targets, self.max_len, self.pad_id);
            let shape = (chunk.len(), self.max_len);
            out.push(Batch::Seq2Seq {
                source_ids: Tensor::from_vec(src_ids, shape, device)?,
                source_mask: Some(Tensor::from_vec(src_keep, shape, device)?),
                target_ids: Tensor::from_vec(tgt_ids, shape, device)?,
                labels: Some(Tensor::from_vec(labels, shape, device)?),
            });
        }
        Ok(out)
    }
}
