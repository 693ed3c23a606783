//! Attention mask construction.
//!
//! Boolean masks are `u8` tensors where `1` means "attend" and `0` means
//! "discard". They are combined as booleans and converted to an additive bias
//! exactly once, right before they reach the attention scores.

use candle_core::{DType, Device, Tensor};

use crate::error::{ModelError, Result};

/// Additive value for discarded positions.
///
/// The most negative finite `f32`, so a fully masked row still softmaxes to a
/// finite (uniform) distribution instead of NaN.
pub const MASK_VALUE: f32 = f32::MIN;

pub(crate) fn dims2(t: &Tensor, what: &str) -> Result<(usize, usize)> {
    t.dims2().map_err(|_| {
        ModelError::shape(format!(
            "{what} must have shape [batch, seq], got {:?}",
            t.dims()
        ))
    })
}

/// Per-position "is real token" flags for `tokens[batch, seq]`.
///
/// # Errors
/// Returns [`ModelError::Shape`] if `tokens` is not rank 2.
pub fn padding_mask(tokens: &Tensor, pad_id: u32) -> Result<Tensor> {
    dims2(tokens, "token ids")?;
    Ok(tokens.ne(pad_id)?)
}

/// Lower-triangular `[seq, seq]` mask: query `i` may attend to keys `0..=i`.
///
/// # Errors
/// Returns [`ModelError::Configuration`] if `seq_len` exceeds the context window.
pub fn causal_mask(seq_len: usize, context_window: usize, device: &Device) -> Result<Tensor> {
    if seq_len > context_window {
        return Err(ModelError::config(format!(
            "sequence length {seq_len} exceeds context window {context_window}"
        )));
    }
    Ok(Tensor::tril2(seq_len, DType::U8, device)?)
}

/// Expand `keep[batch, seq]` to `[batch, 1, 1, seq]` so every head and query
/// sees the same key padding.
///
/// # Errors
/// Returns [`ModelError::Shape`] if `keep` is not rank 2.
pub fn key_padding_mask(keep: &Tensor) -> Result<Tensor> {
    dims2(keep, "attention mask")?;
    Ok(keep.to_dtype(DType::U8)?.unsqueeze(1)?.unsqueeze(1)?)
}

/// Key padding AND causality: `[batch, 1, seq, seq]`.
///
/// # Errors
/// Returns [`ModelError::Shape`] for a malformed `keep` mask and
/// [`ModelError::Configuration`] if the sequence exceeds the context window.
pub fn causal_padding_mask(keep: &Tensor, context_window: usize) -> Result<Tensor> {
    let (_, t) = dims2(keep, "attention mask")?;
    let causal = causal_mask(t, context_window, keep.device())?
        .unsqueeze(0)?
        .unsqueeze(0)?;
    let keys = key_padding_mask(keep)?;
    Ok(causal.broadcast_mul(&keys)?)
}

/// Convert a boolean mask to additive form: keep → `0`, discard → [`MASK_VALUE`].
///
/// # Errors
/// Returns an error if tensor operations fail.
pub fn to_additive(mask: &Tensor) -> Result<Tensor> {
    let device = mask.device();
    let zeros = Tensor::zeros(mask.dims(), DType::F32, device)?;
    let masked = Tensor::full(MASK_VALUE, mask.dims(), device)?;
    Ok(mask.to_dtype(DType::U8)?.where_cond(&zeros, &masked)?)
}

/// Check that a caller-supplied `[batch, seq]` mask matches its tokens.
///
/// # Errors
/// Returns [`ModelError::Shape`] on any dimension mismatch.
pub fn validate_attention_mask(tokens: &Tensor, mask: &Tensor) -> Result<()> {
    let (b, t) = dims2(tokens, "token ids")?;
    let (mb, mt) = dims2(mask, "attention mask")?;
    if (b, t) != (mb, mt) {
        return Err(ModelError::shape(format!(
            "attention mask [{mb}, {mt}] does not match tokens [{b}, {t}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_shape_and_values() {
        let device = Device::Cpu;
        let mask = causal_mask(3, 8, &device).unwrap();
        assert_eq!(mask.dims(), &[3, 3]);
        let values: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(values, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
    }

    #[test]
    fn test_causal_mask_rejects_long_sequence() {
        let device = Device::Cpu;
        assert!(matches!(
            causal_mask(9, 8, &device),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn test_padding_mask() {
        let device = Device::Cpu;
        let tokens = Tensor::new(&[[5u32, 6, 0, 0], [7, 0, 0, 0]], &device).unwrap();
        let mask = padding_mask(&tokens, 0).unwrap();
        let values: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(values, vec![vec![1, 1, 0, 0], vec![1, 0, 0, 0]]);
    }

    #[test]
    fn test_causal_padding_mask_is_and() {
        let device = Device::Cpu;
        let keep = Tensor::new(&[[1u8, 1, 0]], &device).unwrap();
        let mask = causal_padding_mask(&keep, 8).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<u8>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 0]]);
    }

    #[test]
    fn test_additive_uses_finite_minimum() {
        let device = Device::Cpu;
        let mask = causal_mask(2, 2, &device).unwrap();
        let bias: Vec<Vec<f32>> = to_additive(&mask).unwrap().to_vec2().unwrap();
        assert_eq!(bias[0][0], 0.0);
        assert_eq!(bias[0][1], MASK_VALUE);
        assert!(bias[0][1].is_finite());
        assert_eq!(bias[1][1], 0.0);
    }

    #[test]
    fn test_fully_masked_row_softmax_is_finite() {
        let device = Device::Cpu;
        let bias = to_additive(&Tensor::zeros((1, 4), DType::U8, &device).unwrap()).unwrap();
        let probs = candle_nn::ops::softmax(&bias, 1).unwrap();
        let probs: Vec<Vec<f32>> = probs.to_vec2().unwrap();
        assert!(probs[0].iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_validate_attention_mask_shape() {
        let device = Device::Cpu;
        let tokens = Tensor::zeros((2, 4), DType::U32, &device).unwrap();
        let good = Tensor::ones((2, 4), DType::U8, &device).unwrap();
        let bad = Tensor::ones((1, 4), DType::U8, &device).unwrap();
        assert!(validate_attention_mask(&tokens, &good).is_ok());
        assert!(matches!(
            validate_attention_mask(&tokens, &bad),
            Err(ModelError::Shape(_))
        ));
    }
}
