//! Sequence losses.
//!
//! A loss sees every position of an unrolled window at once: outputs are flattened to
//! `[num_steps * batch, width]` and targets are prepared to match. The loss is averaged
//! over positions, so its gradient is scaled accordingly.

use crate::backprop;
use crate::error::{Result, RnnError};
use crate::ops::cpu::FnF64Ten64;
use crate::shapes::{DType, Targets};
use crate::tensors::Ten64;
use serde::{Deserialize, Serialize};

/// A scalar training objective with its gradient.
pub trait Loss: Send + Sync {
    fn name(&self) -> &'static str;

    /// The target dtype this loss accepts.
    fn target_dtype(&self) -> DType;

    /// Computes the loss and a closure mapping `dL/dloss` to `dL/d(outputs)`.
    fn forward<'a>(&self, outputs: &'a Ten64, targets: &'a Targets) -> Result<(f64, Box<FnF64Ten64<'a>>)>;
}

/// Cross entropy of softmax outputs against class ids, averaged over positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceLoss;

/// Mean squared error over every output element.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredLoss;

impl Loss for SequenceLoss {
    fn name(&self) -> &'static str {
        "sequence_loss"
    }

    fn target_dtype(&self) -> DType {
        DType::Int32
    }

    fn forward<'a>(&self, outputs: &'a Ten64, targets: &'a Targets) -> Result<(f64, Box<FnF64Ten64<'a>>)> {
        match targets {
            Targets::Classes(labels) => sequence_loss(outputs, labels),
            Targets::Values(_) => Err(RnnError::InvalidConfig(
                "sequence loss needs int32 class targets".into(),
            )),
        }
    }
}

impl Loss for MeanSquaredLoss {
    fn name(&self) -> &'static str {
        "mean_squared"
    }

    fn target_dtype(&self) -> DType {
        DType::Float32
    }

    fn forward<'a>(&self, outputs: &'a Ten64, targets: &'a Targets) -> Result<(f64, Box<FnF64Ten64<'a>>)> {
        match targets {
            Targets::Values(values) if values.shape == outputs.shape => {
                Ok(backprop::mse_loss(outputs, values))
            }
            Targets::Values(values) => Err(RnnError::ShapeMismatch {
                context: "mean squared loss",
                expected: outputs.shape.clone(),
                got: values.shape.clone(),
            }),
            Targets::Classes(_) => Err(RnnError::InvalidConfig(
                "mean squared loss needs float32 targets".into(),
            )),
        }
    }
}

/// Averaged cross entropy for 2-D `[positions, classes]` or 3-D
/// `[num_steps, batch, classes]` outputs against one class id per position.
///
/// The returned gradient has the shape of `outputs`.
///
/// # Errors
/// Fails for other ranks, a label count that differs from the number of positions,
/// or labels outside the class range.
pub fn sequence_loss<'a>(outputs: &Ten64, labels: &'a [usize]) -> Result<(f64, Box<FnF64Ten64<'a>>)> {
    let (logits, shape) = match outputs.rank() {
        2 => (outputs.clone(), None),
        3 => {
            let [t, b, c] = [outputs.shape[0], outputs.shape[1], outputs.shape[2]];
            (outputs.clone().reshape([t * b, c]), Some(outputs.shape.clone()))
        }
        rank => {
            return Err(RnnError::InvalidData(format!(
                "outputs must be a 2-D or 3-D tensor, got rank {rank}"
            )));
        }
    };
    let (rows, classes) = logits.dims2();
    if labels.len() != rows {
        return Err(RnnError::ShapeMismatch {
            context: "sequence loss labels",
            expected: vec![rows],
            got: vec![labels.len()],
        });
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(RnnError::InvalidData(format!(
            "label {bad} is outside {classes} classes"
        )));
    }

    let (loss, back) = backprop::softmax_cross_entropy(&logits, labels);
    match shape {
        None => Ok((loss, back)),
        Some(shape) => Ok((loss, Box::new(move |g| back(g).reshape(shape.clone())))),
    }
}

/// Serializable choice of loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    SequenceLoss,
    MeanSquared,
}

impl LossKind {
    pub fn build(self) -> Box<dyn Loss> {
        match self {
            LossKind::SequenceLoss => Box::new(SequenceLoss),
            LossKind::MeanSquared => Box::new(MeanSquaredLoss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_give_log_classes() {
        let outputs = Ten64::zeros([4, 8]);
        let labels = [0, 3, 5, 7];
        let (loss, back) = sequence_loss(&outputs, &labels).unwrap();
        assert!((loss - 8f64.ln()).abs() < 1e-12);
        let grad = back(1.0);
        let row_sum: f64 = grad.data[..8].iter().sum();
        assert!(row_sum.abs() < 1e-12);
    }

    #[test]
    fn three_dimensional_outputs_keep_their_shape() {
        let outputs = Ten64::zeros([2, 3, 4]);
        let labels = [1; 6];
        let (_, back) = sequence_loss(&outputs, &labels).unwrap();
        assert_eq!(back(1.0).shape, vec![2, 3, 4]);
    }

    #[test]
    fn rejects_rank_one_outputs() {
        let outputs = Ten64::zeros([4]);
        assert!(sequence_loss(&outputs, &[0, 0, 0, 0]).is_err());
    }
}
