//! Sampling utilities for generation.
//!
//! Implements temperature scaling, top-k, top-p (nucleus) filtering, and categorical sampling.
//! Filters work on logits and discard candidates by setting them to negative infinity.

use std::cmp::Ordering;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

use crate::error::{ModelError, Result};

/// Sample a token ID from a logits vector.
///
/// `temperature == 0` is greedy decoding. Otherwise exactly one filter is
/// applied: top-k when `top_k` is set, nucleus filtering with `top_p` when not.
///
/// # Errors
/// Returns [`ModelError::Sampling`] if the logits hold no finite value.
pub fn sample_next(
    logits: &[f32],
    temperature: f32,
    top_k: Option<usize>,
    top_p: f32,
    rng: &mut impl Rng,
) -> Result<u32> {
    if temperature <= 0.0 {
        return argmax(logits);
    }

    let mut filtered = apply_temperature(logits, temperature);
    match top_k {
        Some(k) => top_k_filter(&mut filtered, k),
        None => top_p_filter(&mut filtered, top_p),
    }

    let probs = softmax(&filtered);
    sample_categorical(&probs, rng)
}

/// Index of the largest finite logit.
///
/// # Errors
/// Returns [`ModelError::Sampling`] if no logit is finite.
#[allow(clippy::cast_possible_truncation)]
pub fn argmax(logits: &[f32]) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &v) in logits.iter().enumerate() {
        if v.is_finite() && best.is_none_or(|(_, b)| v > b) {
            best = Some((idx, v));
        }
    }
    best.map(|(idx, _)| idx as u32)
        .ok_or_else(|| ModelError::Sampling("no finite logits to choose from".into()))
}

/// Divide every logit by `temperature`.
///
/// Logits are shifted so the largest finite one is `0` before scaling. The
/// distribution is unchanged, and a tiny temperature cannot overflow the
/// best candidate to `+inf`.
#[must_use]
pub fn apply_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    if (temperature - 1.0).abs() <= 1e-6 {
        return logits.to_vec();
    }
    let max_logit = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return logits.to_vec();
    }
    logits.iter().map(|v| (v - max_logit) / temperature).collect()
}

/// Keep the `k` highest logits. Ties with the k-th value survive.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect::<Vec<_>>();

    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let Some(&kth) = sorted.get(k - 1) else {
        return;
    };

    for v in logits {
        if !v.is_finite() || *v < kth {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filtering.
///
/// Candidates are visited in descending probability; a candidate is dropped
/// once the mass of the candidates before it already exceeds `top_p`. The most
/// likely candidate therefore always survives. `top_p >= 1` keeps everything.
pub fn top_p_filter(logits: &mut [f32], top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut order = (0..logits.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

    let mut keep = vec![false; logits.len()];
    let mut cum = 0.0_f32;
    for &idx in &order {
        if cum > top_p {
            break;
        }
        keep[idx] = true;
        cum += probs[idx];
    }

    if !keep.iter().zip(&probs).any(|(k, p)| *k && *p > 0.0) {
        if let Ok(best) = argmax(logits) {
            keep[best as usize] = true;
        }
    }

    for (v, k) in logits.iter_mut().zip(keep) {
        if !k {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Numerically stable softmax. Non-finite logits get probability zero; if
/// none is finite every probability is zero.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);

    if !max_logit.is_finite() {
        return vec![0.0; logits.len()];
    }

    let mut exps = Vec::with_capacity(logits.len());
    let mut sum = 0.0_f32;
    for &v in logits {
        let e = if v.is_finite() {
            (v - max_logit).exp()
        } else {
            0.0
        };
        sum += e;
        exps.push(e);
    }

    if sum == 0.0 {
        return vec![0.0; logits.len()];
    }

    exps.into_iter().map(|e| e / sum).collect()
}

/// Draw one index with probability proportional to `probs`.
///
/// # Errors
/// Returns [`ModelError::Sampling`] if the weights are empty, all zero or invalid.
#[allow(clippy::cast_possible_truncation)]
pub fn sample_categorical(probs: &[f32], rng: &mut impl Rng) -> Result<u32> {
    let dist = WeightedIndex::new(probs)
        .map_err(|e| ModelError::Sampling(format!("degenerate distribution: {e}")))?;
    Ok(dist.sample(rng) as u32)
}
