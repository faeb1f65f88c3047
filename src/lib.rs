//! briny_rnn: stacked recurrent networks in Rust.
//!
//! Build a multi-layer recurrent network from declarative cells, unroll it over fixed
//! windows for training, validation and evaluation, and persist it as `.bpat`
//! checkpoints.
//!
//! # Features
//!
//! - Basic RNN, LSTM (peepholes, cell clipping, output projection) and GRU cells with
//!   closed-form backward closures.
//! - Optional word embedding and output projection around the cell stack.
//! - Truncated BPTT with the recurrent state threaded across windows.
//! - Gradient descent, momentum, Adagrad, RMSProp and Adam with gradient clipping.
//! - Checkpoints with named tensors, validated on load.
//!
//! # Modules
//!
//! - [`tensors`]: Core tensor data structures and operations.
//! - [`backprop`]: Differentiable operations and optimizer updates.
//! - [`cells`]: Recurrent cells and their declarative specs.
//! - [`network`]: The compiled parameter set shared by every model.
//! - [`model`]: Unrolled models, one window at a time.
//! - [`trainer`] / [`evaluator`]: Training and evaluation runs.
//! - [`rnn`]: The builder tying everything together.
//! - [`modelio`]: Checkpoints and the supervisor.
//!
//! # Example
//!
//! ```rust
//! use briny_rnn::prelude::*;
//!
//! let mut rnn = Rnn::new("sine").with_seed(7).with_save_model_secs(None);
//! rnn.set_input(&[1], DType::Float32, None, None).unwrap();
//! rnn.set_output(&[1], DType::Float32).unwrap();
//! rnn.set_target(&[1], DType::Float32).unwrap();
//! rnn.set_loss_func(Box::new(MeanSquaredLoss)).unwrap();
//! rnn.add_cell(CellSpec::gru(8)).unwrap();
//! rnn.compile(false).unwrap();
//! assert!(rnn.network().unwrap().has_projection());
//! ```

pub mod backprop;
pub mod cells;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod loss;
pub mod model;
pub mod modelio;
pub mod network;
pub mod ops;
pub mod optim;
pub mod rnn;
pub mod shapes;
pub mod tensors;
pub mod trainer;

/// The types needed to declare, train and evaluate a network.
pub mod prelude {
    pub use crate::cells::{CellSpec, CellState, Initializer};
    pub use crate::config::{EvaluatorConfig, RnnConfig, ValidatorConfig};
    pub use crate::data::{Feeder, SequenceProducer, WindowFeeder};
    pub use crate::error::{Result, RnnError};
    pub use crate::loss::{LossKind, MeanSquaredLoss, SequenceLoss};
    pub use crate::model::{RnnModel, RunStats};
    pub use crate::optim::{Clipper, OptimizerKind};
    pub use crate::rnn::{EpochSummary, Rnn, Validation};
    pub use crate::shapes::DType;
    pub use crate::tensors::{Ten64, Tensor};
    pub use crate::trainer::TrainerConfig;
}
