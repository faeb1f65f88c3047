//! The compiled parameter set shared by every unrolled model.
//!
//! A [`Network`] owns the optional embedding table, the cell stack and the optional
//! output projection. Unrolled models never own weights: they borrow the network for
//! each window, so training, validation and evaluation always see the same values.
//!
//! Parameters are addressed by scoped names:
//!
//! ```text
//! <name>/embedding/embedding
//! <name>/multi_rnn_cell/cell_<i>/<param>
//! <name>/project/project_w
//! <name>/project/project_b
//! ```
//!
//! [`Network::named_params`] and [`Network::params_mut`] enumerate them in this order,
//! which is also the order of [`Gradients::tensors`] and of the tensors in a checkpoint.

use crate::cells::{Cell, CellSpec, CellState, Initializer};
use crate::error::{Result, RnnError};
use crate::modelio::Checkpoint;
use crate::shapes::{InputDecl, OutputDecl, TargetDecl};
use crate::tensors::{Ten64, WithGrad};
use rand::rngs::StdRng;

/// One state per layer of the stack.
pub type StackState = Vec<CellState>;

/// Dense layer mapping the last cell's output onto the declared output width.
#[derive(Debug, Clone)]
pub struct Projection {
    pub weight: WithGrad<Ten64>,
    pub bias: WithGrad<Ten64>,
}

/// Gradients of every parameter, in [`Network::named_params`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub tensors: Vec<Ten64>,
}

impl Gradients {
    /// `sqrt(Σ ‖g‖²)` over all tensors.
    pub fn global_norm(&self) -> f64 {
        self.tensors.iter().map(Ten64::sq_norm).sum::<f64>().sqrt()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[derive(Debug)]
pub struct Network {
    name: String,
    input: InputDecl,
    output: OutputDecl,
    target: TargetDecl,
    embedding: Option<WithGrad<Ten64>>,
    cells: Vec<Box<dyn Cell>>,
    projection: Option<Projection>,
    /// Number of optimizer updates applied so far.
    pub global_step: u64,
}

impl Network {
    /// Builds every parameter of the stack.
    ///
    /// A projection is added when the last cell's output width differs from the
    /// declared output width.
    pub(crate) fn build(
        name: &str,
        input: InputDecl,
        output: OutputDecl,
        target: TargetDecl,
        specs: &[CellSpec],
        init: &Initializer,
        rng: &mut StdRng,
    ) -> Result<Self> {
        init.validate()?;
        input.validate()?;
        output.validate()?;
        target.validate(&output)?;
        if specs.is_empty() {
            return Err(RnnError::MissingDeclaration(
                "the cell stack is empty, call add_cell first",
            ));
        }

        let embedding = match (input.vocab_size, input.embedding_size) {
            (Some(vocab), Some(dim)) => Some(init.sample([vocab, dim], rng)),
            _ => None,
        };

        let mut width = input.step_width();
        let mut cells = Vec::with_capacity(specs.len());
        for spec in specs {
            let cell = spec.build(width, init, rng)?;
            width = cell.output_size();
            cells.push(cell);
        }

        let out_width = output.width();
        let projection = (width != out_width).then(|| Projection {
            weight: init.sample([width, out_width], rng),
            bias: WithGrad::new(Ten64::zeros([out_width])),
        });

        Ok(Self {
            name: name.to_string(),
            input,
            output,
            target,
            embedding,
            cells,
            projection,
            global_step: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &InputDecl {
        &self.input
    }

    pub fn output(&self) -> &OutputDecl {
        &self.output
    }

    pub fn target(&self) -> &TargetDecl {
        &self.target
    }

    pub fn cells(&self) -> &[Box<dyn Cell>] {
        &self.cells
    }

    pub fn embedding(&self) -> Option<&WithGrad<Ten64>> {
        self.embedding.as_ref()
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    /// Width of the outputs handed to the loss.
    pub fn output_width(&self) -> usize {
        self.output.width()
    }

    pub fn zero_state(&self, batch_size: usize) -> StackState {
        self.cells.iter().map(|c| c.zero_state(batch_size)).collect()
    }

    /// Checks that a stack state fits this network for the given batch size.
    pub fn check_state(&self, state: &[CellState], batch_size: usize) -> Result<()> {
        if state.len() != self.cells.len() {
            return Err(RnnError::InvalidState(format!(
                "expected one state per layer ({}), got {}",
                self.cells.len(),
                state.len()
            )));
        }
        for (i, (cell, s)) in self.cells.iter().zip(state).enumerate() {
            if !cell.zero_state(batch_size).same_layout(s) {
                return Err(RnnError::InvalidState(format!(
                    "layer {i} ({}) state does not match batch size {batch_size}",
                    cell.kind()
                )));
            }
        }
        Ok(())
    }

    pub fn named_params(&self) -> Vec<(String, &WithGrad<Ten64>)> {
        let mut params = Vec::new();
        if let Some(e) = &self.embedding {
            params.push((format!("{}/embedding/embedding", self.name), e));
        }
        for (i, cell) in self.cells.iter().enumerate() {
            for (param, w) in cell.params() {
                params.push((format!("{}/multi_rnn_cell/cell_{i}/{param}", self.name), w));
            }
        }
        if let Some(p) = &self.projection {
            params.push((format!("{}/project/project_w", self.name), &p.weight));
            params.push((format!("{}/project/project_b", self.name), &p.bias));
        }
        params
    }

    pub fn params_mut(&mut self) -> Vec<&mut WithGrad<Ten64>> {
        let mut params = Vec::new();
        if let Some(e) = &mut self.embedding {
            params.push(e);
        }
        for cell in &mut self.cells {
            params.extend(cell.params_mut());
        }
        if let Some(p) = &mut self.projection {
            params.push(&mut p.weight);
            params.push(&mut p.bias);
        }
        params
    }

    pub fn num_params(&self) -> usize {
        self.named_params().iter().map(|(_, w)| w.value.len()).sum()
    }

    pub fn zero_gradients(&self) -> Gradients {
        Gradients {
            tensors: self
                .named_params()
                .into_iter()
                .map(|(_, w)| w.value.zeros_like())
                .collect(),
        }
    }

    /// Index of each cell's first parameter in the flat parameter order.
    pub(crate) fn cell_offsets(&self) -> Vec<usize> {
        let mut offset = usize::from(self.has_embedding());
        self.cells
            .iter()
            .map(|cell| {
                let start = offset;
                offset += cell.params().len();
                start
            })
            .collect()
    }

    /// Index of the projection weight in the flat parameter order.
    pub(crate) fn projection_offset(&self) -> usize {
        usize::from(self.has_embedding())
            + self.cells.iter().map(|c| c.params().len()).sum::<usize>()
    }

    /// Snapshot of every parameter value and the global step.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            global_step: self.global_step,
            tensors: self
                .named_params()
                .into_iter()
                .map(|(name, w)| (name, w.value.clone()))
                .collect(),
        }
    }

    /// Overwrites every parameter from a checkpoint taken of a network with the same
    /// structure.
    ///
    /// # Errors
    /// Fails without modifying anything if names, count or shapes differ.
    pub fn load_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let expected: Vec<(String, Vec<usize>)> = self
            .named_params()
            .into_iter()
            .map(|(name, w)| (name, w.value.shape.clone()))
            .collect();
        if expected.len() != checkpoint.tensors.len() {
            return Err(RnnError::Checkpoint(format!(
                "expected {} tensors, checkpoint holds {}",
                expected.len(),
                checkpoint.tensors.len()
            )));
        }
        for ((name, shape), (stored, tensor)) in expected.iter().zip(&checkpoint.tensors) {
            if name != stored {
                return Err(RnnError::Checkpoint(format!(
                    "expected tensor `{name}`, found `{stored}`"
                )));
            }
            if *shape != tensor.shape {
                return Err(RnnError::Checkpoint(format!(
                    "tensor `{name}` has shape {:?}, expected {shape:?}",
                    tensor.shape
                )));
            }
        }

        for (param, (_, tensor)) in self.params_mut().into_iter().zip(checkpoint.tensors) {
            param.value.update(tensor);
            param.grad = param.value.zeros_like();
        }
        self.global_step = checkpoint.global_step;
        Ok(())
    }
}
