//! # Operation Kernels
//!
//! Forward/backward kernels behind the public [`crate::backprop`] surface.
//!
//! ## Submodules
//!
//! - [`cpu`]: multi-threaded CPU operations built on `rayon`
//!
//! ## Extending
//!
//! To add a new operation:
//!
//! 1. Implement it in [`cpu`], returning the forward value and a backward closure
//! 2. Re-export it through [`crate::backprop`] with its shape checks
//!
//! ## Notes
//!
//! - Operations must return both forward values and backward closures
//! - Optimizer updates are in-place and reset the gradient afterwards

pub mod cpu;
