//! Core tensor data structures and operations.
//!
//! # Core Tensor Utilities
//!
//! This module defines the dense, row-major tensors every other module passes around:
//! cell activations, recurrent states, parameters and their gradients.
//!
//! It supports:
//! - Construction of N-dimensional tensors with shape and row-major data layout
//! - Gradient pairing through [`WithGrad`]
//! - The handful of 2-D kernels a recurrent cell needs (products with and without
//!   transposes, column concatenation/splitting, row broadcasting)
//! - Compile-time tensor literals through the [`tensor!`](crate::tensor) macro
//!
//! ## Design Highlights
//! - Tensors are strongly typed: `Tensor<T>` for any element type, [`Ten64`] for the
//!   `f64` tensors the networks compute with
//! - Shape is stored as a `Vec<usize>` and enforced at runtime
//! - Matrix products are parallelised over output rows with `rayon`
//!
//! ## Limitations
//! - Row-major only
//! - Broadcasting is limited to a row vector over a matrix
//!
//! ## Example
//!
//! ```rust
//! use briny_rnn::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape, vec![2, 3]);
//! ```

use crate::error::{Result, RnnError};
use rand::Rng;
use rayon::prelude::*;

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - All elements must be the same type (`T`).
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

/// The tensor type used by every network computation.
pub type Ten64 = Tensor<f64>;

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Fallible variant of [`Tensor::new`] for data coming from callers.
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(RnnError::InvalidData(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Replaces this tensor's data with another tensor of the same shape.
    ///
    /// # Panics
    /// Panics if shapes do not match.
    pub fn update(&mut self, mut other: Tensor<T>) {
        assert_eq!(self.shape, other.shape, "shape mismatch");
        std::mem::swap(&mut self.data, &mut other.data);
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// A container for tracking gradients of values.
///
/// Parameters are stored as `WithGrad<Ten64>`; optimizers read `grad`, update
/// `value` and reset `grad` to zero.
#[derive(Debug, Clone)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl WithGrad<Ten64> {
    /// Wraps a value with a zeroed gradient of the same shape.
    pub fn new(value: Ten64) -> Self {
        let grad = value.zeros_like();
        Self { value, grad }
    }
}

impl Ten64 {
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: impl Into<Vec<usize>>, value: f64) -> Self {
        let shape = shape.into();
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![value; n],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Samples every element uniformly from `[low, high)`.
    pub fn random_uniform<R: Rng>(
        shape: impl Into<Vec<usize>>,
        low: f64,
        high: f64,
        rng: &mut R,
    ) -> Self {
        let shape = shape.into();
        let n = shape.iter().product::<usize>();
        let span = high - low;
        let data = (0..n).map(|_| low + span * rng.random::<f64>()).collect();
        Self { shape, data }
    }

    /// Rows and columns of a matrix.
    ///
    /// # Panics
    /// Panics if the tensor is not 2-D.
    pub fn dims2(&self) -> (usize, usize) {
        assert_eq!(self.shape.len(), 2, "expected a matrix, got shape {:?}", self.shape);
        (self.shape[0], self.shape[1])
    }

    /// Matrix product `self · other` of `[m, k]` and `[k, n]`.
    ///
    /// Output rows are computed in parallel.
    ///
    /// # Panics
    /// Panics if the inner dimensions differ.
    pub fn dot(&self, other: &Ten64) -> Ten64 {
        let (m, k) = self.dims2();
        let (k2, n) = other.dims2();
        assert_eq!(k, k2, "dot shape mismatch: {:?} · {:?}", self.shape, other.shape);

        let mut out = vec![0.0; m * n];
        if n > 0 {
            let a = &self.data;
            let b = &other.data;
            out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                for (l, &a_il) in a[i * k..(i + 1) * k].iter().enumerate() {
                    if a_il == 0.0 {
                        continue;
                    }
                    for (r, &b_lj) in row.iter_mut().zip(&b[l * n..(l + 1) * n]) {
                        *r += a_il * b_lj;
                    }
                }
            });
        }
        Tensor::new(vec![m, n], out)
    }

    /// Product with a transposed right operand: `[m, k] · [n, k]ᵀ`.
    pub fn dot_t(&self, other: &Ten64) -> Ten64 {
        let (m, k) = self.dims2();
        let (n, k2) = other.dims2();
        assert_eq!(k, k2, "dot_t shape mismatch: {:?} · {:?}ᵀ", self.shape, other.shape);

        let mut out = vec![0.0; m * n];
        if n > 0 {
            let a = &self.data;
            let b = &other.data;
            out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                let a_row = &a[i * k..(i + 1) * k];
                for (j, r) in row.iter_mut().enumerate() {
                    *r = a_row
                        .iter()
                        .zip(&b[j * k..(j + 1) * k])
                        .map(|(x, y)| x * y)
                        .sum();
                }
            });
        }
        Tensor::new(vec![m, n], out)
    }

    /// Product with a transposed left operand: `[k, m]ᵀ · [k, n]`.
    pub fn t_dot(&self, other: &Ten64) -> Ten64 {
        let (k, m) = self.dims2();
        let (k2, n) = other.dims2();
        assert_eq!(k, k2, "t_dot shape mismatch: {:?}ᵀ · {:?}", self.shape, other.shape);

        let mut out = vec![0.0; m * n];
        if n > 0 {
            let a = &self.data;
            let b = &other.data;
            out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                for l in 0..k {
                    let a_li = a[l * m + i];
                    if a_li == 0.0 {
                        continue;
                    }
                    for (r, &b_lj) in row.iter_mut().zip(&b[l * n..(l + 1) * n]) {
                        *r += a_li * b_lj;
                    }
                }
            });
        }
        Tensor::new(vec![m, n], out)
    }

    /// Concatenates matrices with the same row count along the columns.
    pub fn hcat(parts: &[&Ten64]) -> Ten64 {
        let rows = parts.first().map_or(0, |p| p.dims2().0);
        let widths: Vec<usize> = parts
            .iter()
            .map(|p| {
                let (r, c) = p.dims2();
                assert_eq!(r, rows, "hcat row mismatch");
                c
            })
            .collect();
        let cols: usize = widths.iter().sum();

        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for (part, &w) in parts.iter().zip(&widths) {
                data.extend_from_slice(&part.data[i * w..(i + 1) * w]);
            }
        }
        Tensor::new(vec![rows, cols], data)
    }

    /// Splits a matrix into consecutive column blocks of the given widths.
    ///
    /// # Panics
    /// Panics if the widths do not sum to the column count.
    pub fn hsplit(&self, widths: &[usize]) -> Vec<Ten64> {
        let (rows, cols) = self.dims2();
        assert_eq!(widths.iter().sum::<usize>(), cols, "hsplit widths do not cover {cols} columns");

        let mut parts: Vec<Vec<f64>> = widths.iter().map(|w| Vec::with_capacity(rows * w)).collect();
        for i in 0..rows {
            let mut offset = i * cols;
            for (part, &w) in parts.iter_mut().zip(widths) {
                part.extend_from_slice(&self.data[offset..offset + w]);
                offset += w;
            }
        }
        parts
            .into_iter()
            .zip(widths)
            .map(|(data, &w)| Tensor::new(vec![rows, w], data))
            .collect()
    }

    /// Stacks matrices with the same column count along the rows.
    pub fn vcat(parts: &[Ten64]) -> Ten64 {
        let cols = parts.first().map_or(0, |p| p.dims2().1);
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            let (r, c) = part.dims2();
            assert_eq!(c, cols, "vcat column mismatch");
            rows += r;
            data.extend_from_slice(&part.data);
        }
        Tensor::new(vec![rows, cols], data)
    }

    /// Adds a row vector `[n]` to every row of an `[m, n]` matrix.
    pub fn add_row(&self, row: &Ten64) -> Ten64 {
        let (_, n) = self.dims2();
        assert_eq!(row.len(), n, "add_row width mismatch");
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(n.max(1)) {
            for (x, b) in chunk.iter_mut().zip(&row.data) {
                *x += b;
            }
        }
        out
    }

    /// Multiplies every row of an `[m, n]` matrix elementwise by a row vector `[n]`.
    pub fn mul_row(&self, row: &Ten64) -> Ten64 {
        let (_, n) = self.dims2();
        assert_eq!(row.len(), n, "mul_row width mismatch");
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(n.max(1)) {
            for (x, w) in chunk.iter_mut().zip(&row.data) {
                *x *= w;
            }
        }
        out
    }

    /// Column sums of a matrix, shape `[n]`.
    pub fn sum_rows(&self) -> Ten64 {
        let (_, n) = self.dims2();
        let mut out = vec![0.0; n];
        for chunk in self.data.chunks(n.max(1)) {
            for (acc, x) in out.iter_mut().zip(chunk) {
                *acc += x;
            }
        }
        Tensor::new(vec![n], out)
    }

    pub fn map(&self, f: impl Fn(f64) -> f64 + Sync + Send) -> Ten64 {
        Tensor::new(self.shape.clone(), self.data.par_iter().map(|&x| f(x)).collect())
    }

    /// Elementwise combination of two tensors of the same shape.
    ///
    /// # Panics
    /// Panics if shapes differ.
    pub fn zip_map(&self, other: &Ten64, f: impl Fn(f64, f64) -> f64 + Sync + Send) -> Ten64 {
        assert_eq!(self.shape, other.shape, "zip_map shape mismatch");
        Tensor::new(
            self.shape.clone(),
            self.data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        )
    }

    pub fn add_assign(&mut self, other: &Ten64) {
        assert_eq!(self.shape, other.shape, "add_assign shape mismatch");
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    pub fn scale(&self, factor: f64) -> Ten64 {
        self.map(|x| x * factor)
    }

    /// The sub-tensor at index `i` of the leading dimension.
    ///
    /// A `[T, B, F]` tensor yields `[B, F]`, a `[T, B]` tensor yields `[B]`.
    pub fn outer(&self, i: usize) -> Ten64 {
        assert!(!self.shape.is_empty() && i < self.shape[0], "outer index {i} out of range");
        let inner: Vec<usize> = self.shape[1..].to_vec();
        let n: usize = inner.iter().product();
        Tensor::new(inner, self.data[i * n..(i + 1) * n].to_vec())
    }

    /// Reinterprets the data with a new shape of equal element count.
    pub fn reshape(self, shape: impl Into<Vec<usize>>) -> Ten64 {
        Tensor::new(shape, self.data)
    }

    pub fn sq_norm(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum()
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_rnn::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
