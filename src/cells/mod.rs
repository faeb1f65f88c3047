//! Recurrent cells.
//!
//! A cell advances one time step: it takes the input `x: [batch, input_size]` and the
//! previous [`CellState`], and returns the output, the next state and a backward
//! closure. The closure maps the gradient flowing into the output and the gradient
//! flowing into the next state back onto the input, the previous state and the cell's
//! own parameters. Chaining those closures in reverse time order is truncated BPTT.
//!
//! | kind | state | output width |
//! |---|---|---|
//! | [`BasicRnnCell`] | `h` | `num_units` |
//! | [`LstmCell`] (basic) | `(c, h)` | `num_units` |
//! | [`LstmCell`] (peepholes, clipping, projection) | `(c, h)` | `num_proj` or `num_units` |
//! | [`GruCell`] | `h` | `num_units` |
//!
//! Gate kernels act on the concatenation `[x, h]`, so a kernel is
//! `[input_size + state_width, gates * num_units]`.

mod basic;
mod gru;
mod lstm;

pub use basic::BasicRnnCell;
pub use gru::GruCell;
pub use lstm::LstmCell;

use crate::error::{Result, RnnError};
use crate::ops::cpu::stable_sigmoid;
use crate::tensors::{Ten64, Tensor, WithGrad};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recurrent state of a single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellState {
    /// Hidden state of a basic RNN or GRU cell, `[batch, num_units]`.
    Hidden(Ten64),
    /// Memory and hidden state of an LSTM cell.
    Lstm { c: Ten64, h: Ten64 },
}

impl CellState {
    /// A state of the same layout filled with zeros.
    pub fn zeros_like(&self) -> Self {
        match self {
            CellState::Hidden(h) => CellState::Hidden(h.zeros_like()),
            CellState::Lstm { c, h } => CellState::Lstm {
                c: c.zeros_like(),
                h: h.zeros_like(),
            },
        }
    }

    /// The state tensors, memory first for LSTM states.
    pub fn tensors(&self) -> Vec<&Ten64> {
        match self {
            CellState::Hidden(h) => vec![h],
            CellState::Lstm { c, h } => vec![c, h],
        }
    }

    /// The part of the state exposed to the next layer and the next step.
    pub fn hidden(&self) -> &Ten64 {
        match self {
            CellState::Hidden(h) | CellState::Lstm { h, .. } => h,
        }
    }

    /// Whether both states have the same variant and tensor shapes.
    pub fn same_layout(&self, other: &CellState) -> bool {
        match (self, other) {
            (CellState::Hidden(a), CellState::Hidden(b)) => a.shape == b.shape,
            (CellState::Lstm { c: c1, h: h1 }, CellState::Lstm { c: c2, h: h2 }) => {
                c1.shape == c2.shape && h1.shape == h2.shape
            }
            _ => false,
        }
    }

    fn expect_hidden(&self, kind: &str, batch: usize, width: usize) -> Result<&Ten64> {
        match self {
            CellState::Hidden(h) if h.shape == [batch, width] => Ok(h),
            _ => Err(RnnError::InvalidState(format!(
                "{kind} cell expects a hidden state of shape [{batch}, {width}]"
            ))),
        }
    }

    fn expect_lstm(&self, batch: usize, c_width: usize, h_width: usize) -> Result<(&Ten64, &Ten64)> {
        match self {
            CellState::Lstm { c, h } if c.shape == [batch, c_width] && h.shape == [batch, h_width] => {
                Ok((c, h))
            }
            _ => Err(RnnError::InvalidState(format!(
                "lstm cell expects (c: [{batch}, {c_width}], h: [{batch}, {h_width}])"
            ))),
        }
    }
}

/// Gradients produced by a cell's backward closure.
#[derive(Debug, Clone)]
pub struct StepGrads {
    /// `dL/dx` for the step input.
    pub input: Ten64,
    /// `dL/d(previous state)`.
    pub state: CellState,
    /// `dL/dθ`, ordered like [`Cell::params`].
    pub params: Vec<Ten64>,
}

/// Backward closure of a single step: `(dL/d(output), dL/d(next state)) -> StepGrads`.
pub type StepBackward<'a> = dyn Fn(&Ten64, &CellState) -> StepGrads + 'a;

/// Output, next state and backward closure of a single step.
pub type StepOutput<'a> = (Ten64, CellState, Box<StepBackward<'a>>);

/// A single recurrent unit.
pub trait Cell: fmt::Debug + Send + Sync {
    /// Short identifier used in parameter names and logs.
    fn kind(&self) -> &'static str;

    fn input_size(&self) -> usize;

    fn output_size(&self) -> usize;

    /// The all-zero state for a batch.
    fn zero_state(&self, batch_size: usize) -> CellState;

    /// Advances one time step.
    ///
    /// # Errors
    /// Fails when the input width or the state layout does not fit the cell.
    fn step<'a>(&'a self, input: &Ten64, state: &CellState) -> Result<StepOutput<'a>>;

    /// Named trainable parameters, in a stable order.
    fn params(&self) -> Vec<(&'static str, &WithGrad<Ten64>)>;

    /// Mutable parameters, in the same order as [`Cell::params`].
    fn params_mut(&mut self) -> Vec<&mut WithGrad<Ten64>>;
}

/// Initial distribution of weight tensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    Uniform { low: f64, high: f64 },
    Constant { value: f64 },
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::Uniform {
            low: -0.1,
            high: 0.1,
        }
    }
}

impl Initializer {
    /// Symmetric uniform initializer `U(-scale, scale)`.
    pub fn uniform(scale: f64) -> Self {
        Initializer::Uniform {
            low: -scale,
            high: scale,
        }
    }

    pub fn sample(&self, shape: impl Into<Vec<usize>>, rng: &mut StdRng) -> WithGrad<Ten64> {
        let value = match *self {
            Initializer::Uniform { low, high } => Tensor::random_uniform(shape, low, high, rng),
            Initializer::Constant { value } => Tensor::filled(shape, value),
        };
        WithGrad::new(value)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match *self {
            Initializer::Uniform { low, high } if !(low < high) => Err(RnnError::InvalidConfig(
                format!("uniform initializer needs low < high, got [{low}, {high})"),
            )),
            _ => Ok(()),
        }
    }
}

fn default_forget_bias() -> f64 {
    1.0
}

/// Declarative description of a cell, turned into a [`Cell`] at compile time once the
/// input width of its layer is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellSpec {
    BasicRnn {
        num_units: usize,
    },
    BasicLstm {
        num_units: usize,
        #[serde(default = "default_forget_bias")]
        forget_bias: f64,
    },
    Lstm {
        num_units: usize,
        #[serde(default = "default_forget_bias")]
        forget_bias: f64,
        #[serde(default)]
        use_peepholes: bool,
        #[serde(default)]
        cell_clip: Option<f64>,
        #[serde(default)]
        num_proj: Option<usize>,
    },
    Gru {
        num_units: usize,
    },
}

impl CellSpec {
    pub fn basic_rnn(num_units: usize) -> Self {
        CellSpec::BasicRnn { num_units }
    }

    pub fn basic_lstm(num_units: usize) -> Self {
        CellSpec::BasicLstm {
            num_units,
            forget_bias: default_forget_bias(),
        }
    }

    /// A full LSTM cell without peepholes, clipping or projection.
    pub fn lstm(num_units: usize) -> Self {
        CellSpec::Lstm {
            num_units,
            forget_bias: default_forget_bias(),
            use_peepholes: false,
            cell_clip: None,
            num_proj: None,
        }
    }

    pub fn gru(num_units: usize) -> Self {
        CellSpec::Gru { num_units }
    }

    /// Width of the output this cell hands to the next layer.
    pub fn output_size(&self) -> usize {
        match *self {
            CellSpec::BasicRnn { num_units }
            | CellSpec::BasicLstm { num_units, .. }
            | CellSpec::Gru { num_units } => num_units,
            CellSpec::Lstm {
                num_units,
                num_proj,
                ..
            } => num_proj.unwrap_or(num_units),
        }
    }

    /// Instantiates the cell for a layer receiving `input_size` features.
    pub fn build(
        &self,
        input_size: usize,
        init: &Initializer,
        rng: &mut StdRng,
    ) -> Result<Box<dyn Cell>> {
        if input_size == 0 {
            return Err(RnnError::InvalidConfig("cell input size must be positive".into()));
        }
        let cell: Box<dyn Cell> = match *self {
            CellSpec::BasicRnn { num_units } => {
                check_units(num_units)?;
                Box::new(BasicRnnCell::new(input_size, num_units, init, rng))
            }
            CellSpec::BasicLstm {
                num_units,
                forget_bias,
            } => {
                check_units(num_units)?;
                Box::new(LstmCell::basic(input_size, num_units, forget_bias, init, rng))
            }
            CellSpec::Lstm {
                num_units,
                forget_bias,
                use_peepholes,
                cell_clip,
                num_proj,
            } => {
                check_units(num_units)?;
                if num_proj == Some(0) {
                    return Err(RnnError::InvalidConfig("num_proj must be positive".into()));
                }
                if let Some(clip) = cell_clip {
                    if !(clip > 0.0) {
                        return Err(RnnError::InvalidConfig(format!(
                            "cell_clip must be positive, got {clip}"
                        )));
                    }
                }
                Box::new(LstmCell::new(
                    input_size,
                    num_units,
                    lstm::LstmOptions {
                        forget_bias,
                        use_peepholes,
                        cell_clip,
                        num_proj,
                    },
                    init,
                    rng,
                ))
            }
            CellSpec::Gru { num_units } => {
                check_units(num_units)?;
                Box::new(GruCell::new(input_size, num_units, init, rng))
            }
        };
        Ok(cell)
    }
}

fn check_units(num_units: usize) -> Result<()> {
    if num_units == 0 {
        return Err(RnnError::InvalidConfig("num_units must be positive".into()));
    }
    Ok(())
}

fn check_input(kind: &str, input: &Ten64, input_size: usize) -> Result<usize> {
    if input.rank() != 2 || input.shape[1] != input_size {
        log::debug!("{kind} cell rejected input of shape {:?}", input.shape);
        return Err(RnnError::ShapeMismatch {
            context: "cell input",
            expected: vec![input.shape.first().copied().unwrap_or(0), input_size],
            got: input.shape.clone(),
        });
    }
    Ok(input.shape[0])
}

pub(crate) fn sigmoid(t: &Ten64) -> Ten64 {
    t.map(stable_sigmoid)
}

pub(crate) fn tanh(t: &Ten64) -> Ten64 {
    t.map(f64::tanh)
}

/// `grad * s * (1 - s)` for a sigmoid output `s`.
fn d_sigmoid(grad: &Ten64, s: &Ten64) -> Ten64 {
    grad.zip_map(s, |g, s| g * s * (1.0 - s))
}

/// `grad * (1 - y²)` for a tanh output `y`.
fn d_tanh(grad: &Ten64, y: &Ten64) -> Ten64 {
    grad.zip_map(y, |g, y| g * (1.0 - y * y))
}

fn mul(a: &Ten64, b: &Ten64) -> Ten64 {
    a.zip_map(b, |x, y| x * y)
}

fn add(a: &Ten64, b: &Ten64) -> Ten64 {
    a.zip_map(b, |x, y| x + y)
}

/// Splits `[rows, left + right]` into `[rows, left]` and `[rows, right]`.
fn split_cols(t: &Ten64, left: usize) -> (Ten64, Ten64) {
    let (rows, cols) = t.dims2();
    let right = cols - left;
    let mut l = Vec::with_capacity(rows * left);
    let mut r = Vec::with_capacity(rows * right);
    for row in t.data.chunks(cols.max(1)) {
        l.extend_from_slice(&row[..left]);
        r.extend_from_slice(&row[left..]);
    }
    (Tensor::new(vec![rows, left], l), Tensor::new(vec![rows, right], r))
}

/// Splits `[rows, K * width]` into `K` blocks of `[rows, width]`.
fn blocks<const K: usize>(t: &Ten64, width: usize) -> [Ten64; K] {
    let (rows, cols) = t.dims2();
    assert_eq!(cols, K * width, "cannot split {cols} columns into {K} blocks of {width}");
    std::array::from_fn(|k| {
        let mut data = Vec::with_capacity(rows * width);
        for r in 0..rows {
            let start = r * cols + k * width;
            data.extend_from_slice(&t.data[start..start + width]);
        }
        Tensor::new(vec![rows, width], data)
    })
}
