//! Input, output and target declarations, and the validation of fed data against them.
//!
//! Fed tensors are time-major: inputs are `[num_steps, batch, ...input_shape]` and
//! targets `[num_steps, batch, ...target_shape]`. Integer data is carried in `f64`
//! tensors and must hold whole, non-negative values.

use crate::error::{Result, RnnError};
use crate::tensors::Ten64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a fed tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Int32,
    Float32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Int32 => f.write_str("int32"),
            DType::Float32 => f.write_str("float32"),
        }
    }
}

/// Per-example input shape, dtype and optional embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    #[serde(default)]
    pub shape: Vec<usize>,
    pub dtype: DType,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub embedding_size: Option<usize>,
}

/// Per-example output shape and dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Per-example target shape and dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDecl {
    #[serde(default)]
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Targets prepared for a loss: class ids or dense values `[num_steps * batch, width]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    Classes(Vec<usize>),
    Values(Ten64),
}

impl InputDecl {
    /// Features each step hands to the first cell.
    pub fn step_width(&self) -> usize {
        self.embedding_size
            .unwrap_or_else(|| self.shape.iter().product())
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding_size.is_some()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match (self.dtype, self.embedding_size, self.vocab_size) {
            (DType::Int32, Some(e), Some(v)) => {
                if e == 0 || v == 0 {
                    return Err(RnnError::InvalidConfig(
                        "vocab_size and embedding_size must be positive".into(),
                    ));
                }
                if !self.shape.is_empty() {
                    return Err(RnnError::InvalidConfig(format!(
                        "embedded inputs are one id per step, got input shape {:?}",
                        self.shape
                    )));
                }
                Ok(())
            }
            (DType::Int32, _, _) => Err(RnnError::InvalidConfig(
                "int32 inputs need both vocab_size and embedding_size".into(),
            )),
            (DType::Float32, Some(_), _) => Err(RnnError::InvalidConfig(
                "embedding requires int32 inputs".into(),
            )),
            (DType::Float32, None, _) => {
                if self.step_width() == 0 {
                    return Err(RnnError::InvalidConfig("input shape has no elements".into()));
                }
                Ok(())
            }
        }
    }

    /// Checks a fed input window.
    pub fn check(&self, data: &Ten64, num_steps: usize, batch_size: usize) -> Result<()> {
        check_shape("inputs", data, num_steps, batch_size, &self.shape)?;
        if self.dtype == DType::Int32 {
            check_ids("inputs", &data.data, self.vocab_size)?;
        }
        Ok(())
    }
}

impl OutputDecl {
    pub fn width(&self) -> usize {
        self.shape.iter().product()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.dtype != DType::Float32 {
            return Err(RnnError::InvalidConfig(format!(
                "outputs are produced as float32, declared {}",
                self.dtype
            )));
        }
        if self.shape.is_empty() || self.width() == 0 {
            return Err(RnnError::InvalidConfig(format!(
                "output shape must be non-empty, got {:?}",
                self.shape
            )));
        }
        Ok(())
    }
}

impl TargetDecl {
    pub(crate) fn validate(&self, output: &OutputDecl) -> Result<()> {
        match self.dtype {
            DType::Int32 if !self.shape.is_empty() => Err(RnnError::InvalidConfig(format!(
                "int32 targets are one class id per step, got target shape {:?}",
                self.shape
            ))),
            DType::Float32 if self.shape.iter().product::<usize>() != output.width() => {
                Err(RnnError::InvalidConfig(format!(
                    "float32 target shape {:?} does not match output shape {:?}",
                    self.shape, output.shape
                )))
            }
            _ => Ok(()),
        }
    }

    /// Checks a fed target window and converts it into loss targets for `width`
    /// outputs per position.
    pub fn prepare(
        &self,
        data: &Ten64,
        num_steps: usize,
        batch_size: usize,
        width: usize,
    ) -> Result<Targets> {
        check_shape("targets", data, num_steps, batch_size, &self.shape)?;
        match self.dtype {
            DType::Int32 => {
                check_ids("targets", &data.data, Some(width))?;
                Ok(Targets::Classes(data.data.iter().map(|&v| v as usize).collect()))
            }
            DType::Float32 => Ok(Targets::Values(
                data.clone().reshape([num_steps * batch_size, width]),
            )),
        }
    }
}

fn check_shape(
    context: &'static str,
    data: &Ten64,
    num_steps: usize,
    batch_size: usize,
    per_example: &[usize],
) -> Result<()> {
    let mut expected = vec![num_steps, batch_size];
    expected.extend_from_slice(per_example);
    if data.shape != expected {
        return Err(RnnError::ShapeMismatch {
            context,
            expected,
            got: data.shape.clone(),
        });
    }
    if data.data.len() != data.shape.iter().product::<usize>() {
        return Err(RnnError::InvalidData(format!(
            "{context} hold {} elements for shape {:?}",
            data.data.len(),
            data.shape
        )));
    }
    Ok(())
}

fn check_ids(context: &str, values: &[f64], upper: Option<usize>) -> Result<()> {
    for &v in values {
        if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
            return Err(RnnError::InvalidData(format!(
                "{context} must hold non-negative integers, found {v}"
            )));
        }
        if let Some(upper) = upper {
            if v as usize >= upper {
                return Err(RnnError::InvalidData(format!(
                    "{context} id {v} is outside [0, {upper})"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> InputDecl {
        InputDecl {
            shape: vec![],
            dtype: DType::Int32,
            vocab_size: Some(5),
            embedding_size: Some(3),
        }
    }

    #[test]
    fn int_inputs_need_embedding() {
        let mut decl = ids();
        decl.embedding_size = None;
        assert!(decl.validate().is_err());
        assert!(ids().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_vocabulary_ids() {
        let data = Ten64::new(vec![2, 1], vec![1.0, 5.0]);
        assert!(matches!(ids().check(&data, 2, 1), Err(RnnError::InvalidData(_))));
    }

    #[test]
    fn rejects_fractional_ids() {
        let data = Ten64::new(vec![1, 2], vec![1.0, 0.5]);
        assert!(ids().check(&data, 1, 2).is_err());
    }

    #[test]
    fn float_targets_flatten_positions() {
        let decl = TargetDecl {
            shape: vec![2],
            dtype: DType::Float32,
        };
        let data = Ten64::new(vec![3, 2, 2], (0..12).map(f64::from).collect());
        match decl.prepare(&data, 3, 2, 2).unwrap() {
            Targets::Values(t) => assert_eq!(t.shape, vec![6, 2]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
