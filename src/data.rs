//! Feeding windows of data into unrolled models.
//!
//! Every model pulls `(inputs, targets)` pairs from a [`Feeder`], one per window. Any
//! `FnMut() -> Result<(Ten64, Ten64)>` closure is a feeder, which keeps one-off data
//! sources short:
//!
//! ```rust
//! use briny_rnn::data::Feeder;
//! use briny_rnn::error::Result;
//! use briny_rnn::tensors::Ten64;
//!
//! let mut feeder = || -> Result<(Ten64, Ten64)> { Ok((Ten64::zeros([2, 1]), Ten64::zeros([2, 1]))) };
//! let (x, y) = feeder.next_batch().unwrap();
//! assert_eq!(x.shape, y.shape);
//! ```

use crate::error::{Result, RnnError};
use crate::tensors::{Ten64, Tensor};

/// Source of time-major `(inputs, targets)` windows.
pub trait Feeder {
    fn next_batch(&mut self) -> Result<(Ten64, Ten64)>;
}

impl<F> Feeder for F
where
    F: FnMut() -> Result<(Ten64, Ten64)>,
{
    fn next_batch(&mut self) -> Result<(Ten64, Ten64)> {
        self()
    }
}

/// Language-model batching of a word id stream.
///
/// The stream is cut into `batch_size` contiguous rows; window `i` covers columns
/// `[i * num_steps, (i + 1) * num_steps)` of every row, and its targets are the same
/// columns shifted by one. Windows are emitted time-major as `[num_steps, batch_size]`
/// and wrap around after [`SequenceProducer::epoch_size`] windows.
#[derive(Debug, Clone)]
pub struct SequenceProducer {
    data: Vec<usize>,
    batch_size: usize,
    num_steps: usize,
    batch_len: usize,
    epoch_size: usize,
    cursor: usize,
}

impl SequenceProducer {
    /// # Errors
    /// Fails when the stream is too short for a single window.
    pub fn new(raw: &[usize], batch_size: usize, num_steps: usize) -> Result<Self> {
        if batch_size == 0 || num_steps == 0 {
            return Err(RnnError::InvalidConfig(
                "batch_size and num_steps must be positive".into(),
            ));
        }
        let batch_len = raw.len() / batch_size;
        let epoch_size = batch_len.saturating_sub(1) / num_steps;
        if epoch_size == 0 {
            return Err(RnnError::InvalidConfig(
                "epoch size is 0, decrease batch_size or num_steps".into(),
            ));
        }
        Ok(Self {
            data: raw[..batch_len * batch_size].to_vec(),
            batch_size,
            num_steps,
            batch_len,
            epoch_size,
            cursor: 0,
        })
    }

    /// Number of distinct windows per pass over the data.
    pub fn epoch_size(&self) -> usize {
        self.epoch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Restarts from the first window.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn window(&self, index: usize, shift: usize) -> Ten64 {
        let mut out = Vec::with_capacity(self.num_steps * self.batch_size);
        for t in 0..self.num_steps {
            for b in 0..self.batch_size {
                let id = self.data[b * self.batch_len + index * self.num_steps + t + shift];
                out.push(id as f64);
            }
        }
        Tensor::new(vec![self.num_steps, self.batch_size], out)
    }
}

impl Feeder for SequenceProducer {
    fn next_batch(&mut self) -> Result<(Ten64, Ten64)> {
        let i = self.cursor;
        self.cursor = (self.cursor + 1) % self.epoch_size;
        Ok((self.window(i, 0), self.window(i, 1)))
    }
}

/// Cycles over prepared windows.
#[derive(Debug, Clone)]
pub struct WindowFeeder {
    windows: Vec<(Ten64, Ten64)>,
    next: usize,
}

impl WindowFeeder {
    pub fn new(windows: Vec<(Ten64, Ten64)>) -> Result<Self> {
        if windows.is_empty() {
            return Err(RnnError::InvalidConfig("window feeder needs at least one window".into()));
        }
        Ok(Self { windows, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Feeder for WindowFeeder {
    fn next_batch(&mut self) -> Result<(Ten64, Ten64)> {
        let window = self.windows[self.next].clone();
        self.next = (self.next + 1) % self.windows.len();
        Ok(window)
    }
}
