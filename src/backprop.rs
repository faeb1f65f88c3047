//! Differentiable operations and autograd utilities.
//!
//! # Backpropagation and Optimization Primitives
//!
//! Provides the operations that sit around the recurrent cells with built-in autograd
//! support: output projection, embedding lookup, losses and optimizer updates.
//!
//! ## Autograd Pattern
//!
//! Each operation follows a simple pattern:
//! 1. **Inputs** are references to activations (`Ten64`) or parameters (`WithGrad<Ten64>`).
//! 2. **Forward Pass** computes an output `Ten64` (or a scalar loss).
//! 3. **Backward Pass** returns a closure borrowing its inputs to compute gradients.
//! 4. **Gradient Application** is left to the caller, which accumulates into parameter
//!    gradient buffers and hands them to an optimizer.
//!
//! ## Usage Guidelines
//!
//! - Operations **panic** on shape mismatches; the unrolled model validates fed data
//!   before anything reaches this module.
//! - The backward closures implement `Fn`, allowing multiple invocations if needed.

use crate::ops::cpu::{self, FnF64Ten64, FnLinearBack, FnScatter, FnTen64, FnTen64Pair};
use crate::tensors::{Ten64, WithGrad};

/// Matrix product of two parameters with gradients for both.
///
/// # Panics
/// Panics if the inner dimensions differ.
pub fn matmul<'a>(a: &'a WithGrad<Ten64>, b: &'a WithGrad<Ten64>) -> (Ten64, Box<FnTen64Pair<'a>>) {
    cpu::matmul(a, b)
}

/// Elementwise logistic sigmoid.
pub fn sigmoid<'a>(input: &Ten64) -> (Ten64, Box<FnTen64<'a>>) {
    cpu::sigmoid(input)
}

/// Elementwise hyperbolic tangent.
pub fn tanh<'a>(input: &Ten64) -> (Ten64, Box<FnTen64<'a>>) {
    cpu::tanh(input)
}

/// Dense layer `input · W + b`.
///
/// # Returns
/// - `out`: `[m, n]` activations.
/// - `back`: Closure mapping `dL/d(out)` to `(dL/d(input), dL/dW, dL/db)`.
///
/// # Example
/// ```rust
/// use briny_rnn::tensor;
/// use briny_rnn::tensors::WithGrad;
///
/// let x = tensor!([[1.0, 2.0]]);
/// let w = WithGrad::new(tensor!([[1.0], [1.0]]));
/// let b = WithGrad::new(tensor!([0.5]));
/// let (out, back) = briny_rnn::backprop::linear(&x, &w, &b);
/// assert_eq!(out.data, vec![3.5]);
/// let (dx, dw, db) = back(&tensor!([[1.0]]));
/// assert_eq!(dx.data, vec![1.0, 1.0]);
/// assert_eq!(dw.data, vec![1.0, 2.0]);
/// assert_eq!(db.data, vec![1.0]);
/// ```
pub fn linear<'a>(
    input: &'a Ten64,
    weight: &'a WithGrad<Ten64>,
    bias: &'a WithGrad<Ten64>,
) -> (Ten64, Box<FnLinearBack<'a>>) {
    cpu::linear(input, weight, bias)
}

/// Looks up embedding rows for word ids.
///
/// # Returns
/// - `out`: `[ids.len(), dim]` embeddings.
/// - `back`: Closure adding `dL/d(out)` rows into a table-shaped accumulator.
pub fn embedding_lookup<'a>(
    table: &'a WithGrad<Ten64>,
    ids: &'a [usize],
) -> (Ten64, Box<FnScatter<'a>>) {
    cpu::embedding_lookup(table, ids)
}

/// Computes Mean Squared Error (MSE) loss: `mean((prediction - target)^2)`.
///
/// # Panics
/// Panics if shapes of `prediction` and `target` differ.
pub fn mse_loss<'a>(prediction: &'a Ten64, target: &'a Ten64) -> (f64, Box<FnF64Ten64<'a>>) {
    assert_eq!(prediction.shape, target.shape);
    cpu::mse_loss(prediction, target)
}

/// Mean softmax cross entropy of `logits: [rows, classes]` against integer labels.
///
/// The backward closure only keeps the softmax probabilities, so `logits` may be a
/// temporary.
pub fn softmax_cross_entropy<'a>(
    logits: &Ten64,
    labels: &'a [usize],
) -> (f64, Box<FnF64Ten64<'a>>) {
    cpu::softmax_cross_entropy(logits, labels)
}

/// Performs an in-place Stochastic Gradient Descent (SGD) update.
///
/// Applies: `param = param - learning_rate * gradient` and then zeros gradient.
pub fn sgd(w: &mut WithGrad<Ten64>, lr: f64) {
    cpu::sgd(w, lr)
}

pub use cpu::{adagrad, adam, momentum, rmsprop};
