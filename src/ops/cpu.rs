//! Parallel CPU tensor operations
//!
//! # CPU Kernels
//!
//! High-throughput CPU implementations of the operations a recurrent network needs
//! around its cells: the dense output projection, the embedding gather, the two losses
//! and the in-place optimizer updates.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon)
//! - Backward closures borrow their forward inputs instead of cloning them
//!
//! ## Implemented Ops
//!
//! - `matmul`: Matrix multiplication with autograd support
//! - `linear`: `input · W + b` with gradients for all three operands
//! - `sigmoid`, `tanh`: elementwise activations with autograd support
//! - `embedding_lookup`: row gather with scatter-add backward
//! - `mse_loss`: Mean squared error loss with autograd
//! - `softmax_cross_entropy`: sparse-label cross entropy with autograd
//! - `sgd`, `momentum`, `adagrad`, `rmsprop`, `adam`: in-place parameter updates
//!
//! ## Design Goals
//!
//! - Deterministic results (given deterministic input and scheduling)
//! - Zero dependencies beyond `rayon`

use crate::tensors::{Ten64, Tensor, WithGrad};
use rayon::prelude::*;

/// Backward closure of [`matmul`]: `dL/dout -> (dL/da, dL/db)`.
pub type FnTen64Pair<'a> = dyn Fn(&Ten64) -> (Ten64, Ten64) + 'a;
/// Backward closure of an elementwise activation.
pub type FnTen64<'a> = dyn Fn(&Ten64) -> Ten64 + 'a;
/// Backward closure of [`linear`]: `dL/dout -> (dL/dinput, dL/dW, dL/db)`.
pub type FnLinearBack<'a> = dyn Fn(&Ten64) -> (Ten64, Ten64, Ten64) + 'a;
/// Backward closure of a scalar loss: `dL/dloss -> dL/dprediction`.
pub type FnF64Ten64<'a> = dyn Fn(f64) -> Ten64 + 'a;
/// Backward closure of [`embedding_lookup`]: scatters `dL/dout` into an accumulator.
pub type FnScatter<'a> = dyn Fn(&Ten64, &mut Ten64) + 'a;

/// Performs matrix multiplication `a · b` of `[m, k]` and `[k, n]`.
///
/// # Returns
/// - Output tensor of shape `[m, n]`
/// - Backward function mapping `dL/dout` to `(dL/da, dL/db)`
pub fn matmul<'a>(a: &'a WithGrad<Ten64>, b: &'a WithGrad<Ten64>) -> (Ten64, Box<FnTen64Pair<'a>>) {
    let out = a.value.dot(&b.value);

    let back = move |grad: &Ten64| (grad.dot_t(&b.value), a.value.t_dot(grad));

    (out, Box::new(back))
}

/// Logistic function without overflow for large negative inputs.
pub(crate) fn stable_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Elementwise sigmoid; the backward closure reuses the forward output.
pub fn sigmoid<'a>(input: &Ten64) -> (Ten64, Box<FnTen64<'a>>) {
    let out = input.map(stable_sigmoid);
    let saved = out.clone();

    let back = move |grad: &Ten64| grad.zip_map(&saved, |g, s| g * s * (1.0 - s));

    (out, Box::new(back))
}

/// Elementwise hyperbolic tangent; the backward closure reuses the forward output.
pub fn tanh<'a>(input: &Ten64) -> (Ten64, Box<FnTen64<'a>>) {
    let out = input.map(f64::tanh);
    let saved = out.clone();

    let back = move |grad: &Ten64| grad.zip_map(&saved, |g, y| g * (1.0 - y * y));

    (out, Box::new(back))
}

/// Computes `out = input · W + b` for `input: [m, k]`, `W: [k, n]`, `b: [n]`.
///
/// # Returns
/// - Output tensor of shape `[m, n]`
/// - Backward function computing gradients w.r.t. input, weight and bias
///
/// # Panics
/// - If `input` and `W` do not chain, or `b` is not `[n]`.
pub fn linear<'a>(
    input: &'a Ten64,
    weight: &'a WithGrad<Ten64>,
    bias: &'a WithGrad<Ten64>,
) -> (Ten64, Box<FnLinearBack<'a>>) {
    let out = input.dot(&weight.value).add_row(&bias.value);

    let back = move |grad: &Ten64| {
        (
            grad.dot_t(&weight.value),
            input.t_dot(grad),
            grad.sum_rows(),
        )
    };

    (out, Box::new(back))
}

/// Gathers rows of an embedding table `[vocab, dim]` for a list of ids.
///
/// The backward closure adds each upstream row into the matching row of a gradient
/// accumulator shaped like the table, so repeated ids accumulate.
///
/// # Panics
/// - If an id is outside the table.
pub fn embedding_lookup<'a>(
    table: &'a WithGrad<Ten64>,
    ids: &'a [usize],
) -> (Ten64, Box<FnScatter<'a>>) {
    let (vocab, dim) = table.value.dims2();

    let mut data = Vec::with_capacity(ids.len() * dim);
    for &id in ids {
        assert!(id < vocab, "embedding id {id} outside vocabulary of {vocab}");
        data.extend_from_slice(&table.value.data[id * dim..(id + 1) * dim]);
    }
    let out = Tensor::new(vec![ids.len(), dim], data);

    let back = move |grad: &Ten64, acc: &mut Ten64| {
        for (row, &id) in grad.data.chunks(dim).zip(ids) {
            for (a, g) in acc.data[id * dim..(id + 1) * dim].iter_mut().zip(row) {
                *a += g;
            }
        }
    };

    (out, Box::new(back))
}

/// Computes the mean squared error (MSE) between predictions and targets,
/// returning both the scalar loss and a gradient function.
///
/// # Formula
/// $$ L = \\frac{1}{n} \\sum_i (y_i - t_i)^2 $$
///
/// # Notes
/// - Forward and backward passes are fully parallelized with `rayon`
pub fn mse_loss<'a>(prediction: &'a Ten64, target: &'a Ten64) -> (f64, Box<FnF64Ten64<'a>>) {
    let n = prediction.data.len().max(1) as f64;

    // parallel forward pass
    let loss = prediction
        .data
        .par_iter()
        .zip(&target.data)
        .map(|(&y, &t)| (y - t).powi(2))
        .sum::<f64>()
        / n;

    // parallel backward pass
    let back = move |grad_output: f64| {
        let grad: Vec<f64> = prediction
            .data
            .par_iter()
            .zip(&target.data)
            .map(|(&y, &t)| 2.0 * (y - t) * grad_output / n)
            .collect();

        Tensor::new(prediction.shape.clone(), grad)
    };

    (loss, Box::new(back))
}

/// Softmax cross entropy of `logits: [rows, classes]` against one class id per row,
/// averaged over rows.
///
/// Uses the log-sum-exp shift so large logits stay finite.
///
/// # Panics
/// - If `labels.len() != rows`, a label is out of range, or there are no classes.
pub fn softmax_cross_entropy<'a>(
    logits: &Ten64,
    labels: &'a [usize],
) -> (f64, Box<FnF64Ten64<'a>>) {
    let (rows, classes) = logits.dims2();
    assert!(classes > 0, "softmax over zero classes");
    assert_eq!(labels.len(), rows, "one label per row expected");

    let mut probs = vec![0.0; rows * classes];
    let total: f64 = probs
        .par_chunks_mut(classes)
        .zip(logits.data.par_chunks(classes))
        .zip(labels.par_iter())
        .map(|((p, z), &label)| {
            assert!(label < classes, "label {label} outside {classes} classes");
            let max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for (pi, &zi) in p.iter_mut().zip(z) {
                *pi = (zi - max).exp();
                sum += *pi;
            }
            for pi in p.iter_mut() {
                *pi /= sum;
            }
            sum.ln() - (z[label] - max)
        })
        .sum();
    let n = rows.max(1) as f64;
    let loss = total / n;

    let back = move |grad_output: f64| {
        let mut grad = probs.clone();
        grad.par_chunks_mut(classes)
            .zip(labels.par_iter())
            .for_each(|(row, &label)| {
                row[label] -= 1.0;
                for g in row.iter_mut() {
                    *g *= grad_output / n;
                }
            });
        Tensor::new(vec![rows, classes], grad)
    };

    (loss, Box::new(back))
}

fn reset_grad(w: &mut WithGrad<Ten64>) {
    for grad in &mut w.grad.data {
        *grad = 0.0;
    }
}

/// Performs one step of stochastic gradient descent (SGD) on the given parameter tensor.
///
/// # Formula
/// $$ w := w - \\text{lr} \\cdot \\frac{\\partial L}{\\partial w} $$
///
/// # Behavior
/// - Updates `w.value` in-place
/// - Zeros out `w.grad` after update (gradient reset step)
pub fn sgd(w: &mut WithGrad<Ten64>, lr: f64) {
    for (param, grad) in w.value.data.iter_mut().zip(&w.grad.data) {
        *param -= lr * *grad;
    }
    reset_grad(w);
}

/// Momentum update: `acc = momentum * acc + g`, `w -= lr * acc`.
pub fn momentum(w: &mut WithGrad<Ten64>, acc: &mut Ten64, lr: f64, momentum: f64) {
    for ((param, grad), a) in w
        .value
        .data
        .iter_mut()
        .zip(&w.grad.data)
        .zip(acc.data.iter_mut())
    {
        *a = momentum * *a + grad;
        *param -= lr * *a;
    }
    reset_grad(w);
}

/// Adagrad update: `acc += g²`, `w -= lr * g / sqrt(acc)`.
pub fn adagrad(w: &mut WithGrad<Ten64>, acc: &mut Ten64, lr: f64) {
    for ((param, grad), a) in w
        .value
        .data
        .iter_mut()
        .zip(&w.grad.data)
        .zip(acc.data.iter_mut())
    {
        *a += grad * grad;
        *param -= lr * grad / a.sqrt();
    }
    reset_grad(w);
}

/// RMSProp update: `ms = decay * ms + (1 - decay) * g²`, `w -= lr * g / sqrt(ms + eps)`.
pub fn rmsprop(w: &mut WithGrad<Ten64>, ms: &mut Ten64, lr: f64, decay: f64, eps: f64) {
    for ((param, grad), s) in w
        .value
        .data
        .iter_mut()
        .zip(&w.grad.data)
        .zip(ms.data.iter_mut())
    {
        *s = decay * *s + (1.0 - decay) * grad * grad;
        *param -= lr * grad / (*s + eps).sqrt();
    }
    reset_grad(w);
}

/// Performs one step of Adam optimization on the given parameter tensor.
///
/// # Arguments
///
/// - `w`: Tensor with gradient to be updated
/// - `m`: First moment estimate (same shape as `w`)
/// - `v`: Second moment estimate (same shape as `w`)
/// - `t`: Current timestep (1-based)
/// - `lr`: Learning rate
/// - `betas`: `(beta1, beta2)` decay rates of the moments
/// - `eps`: Denominator offset
pub fn adam(
    w: &mut WithGrad<Ten64>,
    m: &mut Ten64,
    v: &mut Ten64,
    t: u64,
    lr: f64,
    betas: (f64, f64),
    eps: f64,
) {
    let (beta1, beta2) = betas;
    let t = t as i32;
    let correction1 = 1.0 - beta1.powi(t);
    let correction2 = 1.0 - beta2.powi(t);

    for ((param, grad), (m_val, v_val)) in w
        .value
        .data
        .iter_mut()
        .zip(&w.grad.data)
        .zip(m.data.iter_mut().zip(v.data.iter_mut()))
    {
        *m_val = beta1 * *m_val + (1.0 - beta1) * *grad;
        *v_val = beta2 * *v_val + (1.0 - beta2) * (*grad * *grad);

        let m_hat = *m_val / correction1;
        let v_hat = *v_val / correction2;

        *param -= lr * m_hat / (v_hat.sqrt() + eps);
    }
    reset_grad(w);
}
