//! Ensemble losses.
//!
//! Both losses take `[batch, width, 2]` logits and `[batch, width]` labels
//! drawn from `{NO, YES, IGNORE_INDEX}`.

use std::fmt;
use std::str::FromStr;

use candle_core::{D, DType, Tensor};
use candle_nn::ops::log_softmax;
use serde::{Deserialize, Serialize};

use crate::error::{BiorelError, Result};
use crate::gold::{IGNORE_INDEX, YES};

/// Which loss the ensemble trains with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossPolicy {
    /// Class-weighted cross-entropy; ignore labels are excluded.
    #[default]
    CrossEntropy,
    /// Per-class binary cross-entropy on one-hot targets with a positive
    /// weight per class. Ignore labels are scored as "no".
    BinaryCrossEntropy,
}

impl fmt::Display for LossPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossPolicy::CrossEntropy => f.write_str("cross-entropy"),
            LossPolicy::BinaryCrossEntropy => f.write_str("binary-cross-entropy"),
        }
    }
}

impl FromStr for LossPolicy {
    type Err = BiorelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cross-entropy" | "ce" => Ok(LossPolicy::CrossEntropy),
            "binary-cross-entropy" | "bce" => Ok(LossPolicy::BinaryCrossEntropy),
            other => Err(BiorelError::Config(format!("unknown loss policy {other:?}"))),
        }
    }
}

/// Weighted cross-entropy over non-ignored positions.
///
/// Computes `sum(w[y] * nll) / sum(w[y])` over positions whose label is not
/// [`IGNORE_INDEX`]. When every position is ignored the loss is a constant
/// zero, so the sub-task contributes nothing to the gradient.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor, class_weights: &[f32; 2]) -> Result<Tensor> {
    let (batch, width, classes) = logits.dims3()?;
    let n = batch * width;
    let device = logits.device();

    let labels: Vec<u32> = labels.flatten_all()?.to_vec1()?;
    let mut targets = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);
    for &label in &labels {
        if label == IGNORE_INDEX {
            targets.push(0u32);
            weights.push(0f32);
        } else {
            targets.push(label);
            weights.push(class_weights[label as usize]);
        }
    }
    let denominator: f32 = weights.iter().sum();
    if denominator <= 0.0 {
        return Ok(Tensor::zeros((), DType::F32, device)?);
    }

    let log_probs = log_softmax(&logits.reshape((n, classes))?, D::Minus1)?;
    let targets = Tensor::from_vec(targets, (n, 1), device)?;
    let nll = log_probs.gather(&targets, 1)?.squeeze(1)?.neg()?;
    let weights = Tensor::from_vec(weights, n, device)?;

    Ok(nll
        .mul(&weights)?
        .sum_all()?
        .affine(1.0 / denominator as f64, 0.0)?)
}

/// Binary cross-entropy with logits on one-hot targets, averaged over every
/// element.
///
/// `pos_weight[c]` scales the positive term of class `c`. Ignore labels are
/// mapped to "no" and still count toward the mean.
pub fn binary_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    pos_weight: &[f32; 2],
) -> Result<Tensor> {
    let (batch, width, classes) = logits.dims3()?;
    let n = batch * width;
    let device = logits.device();

    let labels: Vec<u32> = labels.flatten_all()?.to_vec1()?;
    let one_hot: Vec<f32> = labels
        .iter()
        .flat_map(|&label| {
            if label == YES {
                [0.0, 1.0]
            } else {
                [1.0, 0.0]
            }
        })
        .collect();
    let targets = Tensor::from_vec(one_hot, (n, classes), device)?;
    let pos_weight = Tensor::from_vec(pos_weight.to_vec(), (1, classes), device)?;

    let xs = logits.reshape((n, classes))?;
    // log(sigmoid(x)) = -softplus(-x), log(1 - sigmoid(x)) = -softplus(x)
    let log_p = softplus(&xs.neg()?)?.neg()?;
    let log_not_p = softplus(&xs)?.neg()?;

    let positive = targets.broadcast_mul(&pos_weight)?.mul(&log_p)?;
    let negative = targets.affine(-1.0, 1.0)?.mul(&log_not_p)?;
    Ok(positive.add(&negative)?.neg()?.mean_all()?)
}

/// Numerically stable `log(1 + exp(x))`.
fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(xs.relu()?.add(&tail)?)
}
