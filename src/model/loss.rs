//! Token-level cross-entropy with ignored positions.

use candle_core::{D, DType, Tensor};

use crate::error::{ModelError, Result};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Next-token loss: logits at position `i` are scored against `labels[i + 1]`.
///
/// `logits` is `(batch, seq, vocab)` and `labels` must be `(batch, seq)`.
///
/// # Errors
/// Returns [`ModelError::Shape`] if the shapes disagree and
/// [`ModelError::Index`] for labels outside the vocabulary.
pub fn shifted_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits
        .dims3()
        .map_err(|_| ModelError::shape(format!("logits must be rank 3, got {:?}", logits.dims())))?;
    let (lb, lt) = labels
        .dims2()
        .map_err(|_| ModelError::shape(format!("labels must be rank 2, got {:?}", labels.dims())))?;
    if (lb, lt) != (b, t) {
        return Err(ModelError::shape(format!(
            "labels [{lb}, {lt}] do not match logits [{b}, {t}, {v}]"
        )));
    }
    if t < 2 {
        return Ok(Tensor::zeros((), DType::F32, logits.device())?);
    }

    let logits = logits.narrow(1, 0, t - 1)?.reshape((b * (t - 1), v))?;
    let targets = labels
        .to_dtype(DType::I64)?
        .narrow(1, 1, t - 1)?
        .reshape(b * (t - 1))?;
    masked_cross_entropy(&logits, &targets)
}

/// Mean negative log-likelihood over targets that are not [`IGNORE_INDEX`].
///
/// `logits` is `(n, vocab)`, `targets` is `(n,)` of `i64`. When every target
/// is ignored the loss is exactly zero.
///
/// # Errors
/// Returns [`ModelError::Index`] for a non-ignored target outside `0..vocab`.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (_, v) = logits.dims2()?;
    let device = logits.device();

    let keep = targets.ne(IGNORE_INDEX)?;
    let safe = keep.where_cond(targets, &targets.zeros_like()?)?;
    if safe.elem_count() > 0 {
        let min = safe.min(0)?.to_scalar::<i64>()?;
        let max = safe.max(0)?.to_scalar::<i64>()?;
        #[allow(clippy::cast_possible_wrap)]
        if min < 0 || max >= v as i64 {
            return Err(ModelError::Index(format!(
                "label outside vocabulary of {v} (min {min}, max {max})"
            )));
        }
    }

    let keep = keep.to_dtype(DType::F32)?;
    let count = keep.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(Tensor::zeros((), DType::F32, device)?);
    }

    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe.to_dtype(DType::U32)?.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let total = (picked * keep)?.sum_all()?;
    Ok((total.neg()? / f64::from(count))?)
}

/// Turn padded target ids into labels, ignoring padding positions.
///
/// # Errors
/// Returns an error if tensor operations fail.
pub fn labels_from_targets(targets: &Tensor, pad_id: u32) -> Result<Tensor> {
    let keep = targets.ne(pad_id)?;
    let ids = targets.to_dtype(DType::I64)?;
    let ignored = Tensor::full(IGNORE_INDEX, ids.dims(), ids.device())?;
    Ok(keep.where_cond(&ids, &ignored)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[0i64, 1, 2], [3, 2, 1]], &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_ignored_positions_do_not_contribute() {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[[2f32, 0.0, 0.0], [0.0, 3.0, 0.0], [1.0, 1.0, 1.0]]],
            &device,
        )
        .unwrap();
        // Only position 1 (predicting labels[2]) counts.
        let partial = Tensor::new(&[[5i64, IGNORE_INDEX, 1]], &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &partial)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let row = Tensor::new(&[[0f32, 3.0, 0.0]], &device).unwrap();
        let expected = masked_cross_entropy(&row, &Tensor::new(&[1i64], &device).unwrap())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (1, 4, 5), &device).unwrap();
        let labels = Tensor::full(IGNORE_INDEX, (1, 4), &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_label_shape_mismatch() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 4, 5), DType::F32, &device).unwrap();
        let labels = Tensor::zeros((1, 3), DType::I64, &device).unwrap();
        assert!(matches!(
            shifted_cross_entropy(&logits, &labels),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_out_of_vocab_label() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 5), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[0i64, 7]], &device).unwrap();
        assert!(matches!(
            shifted_cross_entropy(&logits, &labels),
            Err(ModelError::Index(_))
        ));
    }

    #[test]
    fn test_labels_from_targets_ignores_padding() {
        let device = Device::Cpu;
        let targets = Tensor::new(&[[1u32, 7, 9, 0, 0]], &device).unwrap();
        let labels: Vec<Vec<i64>> = labels_from_targets(&targets, 0).unwrap().to_vec2().unwrap();
        assert_eq!(labels, vec![vec![1, 7, 9, IGNORE_INDEX, IGNORE_INDEX]]);
    }
}
