//! Unrolled models.
//!
//! # Unrolling
//!
//! An [`RnnModel`] runs the shared [`Network`] over fixed windows of `num_steps` time
//! steps for `batch_size` independent sequences. Between windows it keeps the final
//! recurrent state in `current_state` and feeds it back as the initial state of the
//! next window, so long sequences are processed piecewise.
//!
//! ## Truncated BPTT
//! Gradients flow backwards through the window only: the gradient arriving at the
//! final state is zero, and the initial state is treated as a constant.
//!
//! ## Dropout
//! A model unrolled with `keep_prob < 1` applies inverted dropout to the input and the
//! output of every layer, with fresh masks at every step.
//!
//! # Example
//! ```rust,no_run
//! # use briny_rnn::prelude::*;
//! # fn demo(rnn: &mut Rnn, mut feeder: SequenceProducer) -> briny_rnn::error::Result<()> {
//! let mut model = rnn.unroll(20, 35, None, "Sampler")?;
//! let stats = rnn.run(&mut model, &mut feeder, 10, None)?;
//! println!("perplexity {:.2}", stats.perplexity());
//! # Ok(())
//! # }
//! ```

use crate::backprop;
use crate::cells::{CellState, StepBackward};
use crate::data::Feeder;
use crate::error::{Result, RnnError};
use crate::evaluator::Recorder;
use crate::loss::Loss;
use crate::network::{Gradients, Network, StackState};
use crate::optim::Optimizer;
use crate::tensors::{Ten64, Tensor};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Result of a single window.
#[derive(Debug, Clone)]
pub struct WindowResult {
    pub loss: f64,
    /// Flattened outputs `[num_steps * batch, output_width]`.
    pub outputs: Ten64,
    pub final_state: StackState,
    pub gradients: Option<Gradients>,
}

/// Optional work done after each window of [`RnnModel::run`].
#[derive(Default)]
pub struct RunOps<'a> {
    /// Applies an update with this optimizer after every window.
    pub optimizer: Option<&'a mut Optimizer>,
    /// Records per-window values.
    pub recorder: Option<&'a mut Recorder>,
}

/// Summary of one pass over `epoch_size` windows.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// Average loss per window.
    pub loss: f64,
    pub time: Duration,
    /// Input positions processed per second.
    pub words_per_sec: f64,
    pub windows: usize,
}

impl RunStats {
    pub fn perplexity(&self) -> f64 {
        self.loss.exp()
    }
}

struct LayerTrace<'a> {
    back: Box<StepBackward<'a>>,
    input_mask: Option<Ten64>,
    output_mask: Option<Ten64>,
}

#[derive(Debug, Clone)]
pub struct RnnModel {
    name: String,
    batch_size: usize,
    num_steps: usize,
    keep_prob: Option<f64>,
    current_state: Option<StackState>,
    rng: StdRng,
}

impl RnnModel {
    /// # Errors
    /// Fails for a zero batch size or step count, or a `keep_prob` outside `(0, 1]`.
    pub fn new(
        name: impl Into<String>,
        batch_size: usize,
        num_steps: usize,
        keep_prob: Option<f64>,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 || num_steps == 0 {
            return Err(RnnError::InvalidConfig(
                "batch_size and num_steps must be positive".into(),
            ));
        }
        if let Some(p) = keep_prob {
            if !(p > 0.0 && p <= 1.0) {
                return Err(RnnError::InvalidConfig(format!(
                    "keep_prob must be in (0, 1], got {p}"
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            batch_size,
            num_steps,
            keep_prob,
            current_state: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn keep_prob(&self) -> Option<f64> {
        self.keep_prob
    }

    pub fn current_state(&self) -> Option<&StackState> {
        self.current_state.as_ref()
    }

    /// Sets the current state to zeros.
    pub fn init_state(&mut self, net: &Network) -> &StackState {
        self.current_state.insert(net.zero_state(self.batch_size))
    }

    /// Forgets the current state; the next window starts from zeros.
    pub fn reset_state(&mut self) {
        self.current_state = None;
    }

    /// Replaces the current state after checking it against the cell stack.
    pub fn feed_state(&mut self, net: &Network, state: StackState) -> Result<()> {
        net.check_state(&state, self.batch_size)?;
        self.current_state = Some(state);
        Ok(())
    }

    /// Validates an input window against the declared input.
    pub fn check_inputs(&self, net: &Network, inputs: &Ten64) -> Result<()> {
        net.input().check(inputs, self.num_steps, self.batch_size)
    }

    /// Validates a target window against the declared target.
    pub fn check_targets(&self, net: &Network, targets: &Ten64) -> Result<()> {
        net.target()
            .prepare(targets, self.num_steps, self.batch_size, net.output_width())
            .map(|_| ())
    }

    /// Forward and backward pass over one window from the current state.
    ///
    /// The current state is left untouched; the caller decides whether to thread
    /// [`WindowResult::final_state`] into the next window.
    pub fn loss_and_gradients(
        &mut self,
        net: &Network,
        loss: &dyn Loss,
        inputs: &Ten64,
        targets: &Ten64,
    ) -> Result<WindowResult> {
        self.window(net, loss, inputs, targets, true)
    }

    /// Forward pass over one window from the current state, without gradients.
    pub fn evaluate_window(
        &mut self,
        net: &Network,
        loss: &dyn Loss,
        inputs: &Ten64,
        targets: &Ten64,
    ) -> Result<WindowResult> {
        self.window(net, loss, inputs, targets, false)
    }

    /// Runs `epoch_size` windows pulled from `feeder`.
    ///
    /// The state is initialised when absent and threaded from window to window. With
    /// an optimizer in `ops` every window ends with an update and `global_step` is
    /// incremented. With `verbose_every` set, progress is logged every that many
    /// windows, followed by an epoch summary.
    pub fn run(
        &mut self,
        net: &mut Network,
        loss: &dyn Loss,
        feeder: &mut dyn Feeder,
        epoch_size: usize,
        mut ops: RunOps<'_>,
        verbose_every: Option<usize>,
    ) -> Result<RunStats> {
        if epoch_size == 0 {
            return Err(RnnError::InvalidConfig("epoch_size must be positive".into()));
        }
        if self.current_state.is_none() {
            self.init_state(net);
        }
        let verbose_every = verbose_every.filter(|&v| v > 0);
        let train = ops.optimizer.is_some();
        let words_per_window = (self.num_steps * self.batch_size) as f64;

        let start = Instant::now();
        let mut total_loss = 0.0;
        for i in 0..epoch_size {
            let (inputs, targets) = feeder.next_batch()?;
            let mut result = self.window(net, loss, &inputs, &targets, train)?;

            if let Some(optimizer) = ops.optimizer.as_deref_mut() {
                if let Some(gradients) = result.gradients.take() {
                    optimizer.apply(net.params_mut(), gradients)?;
                    net.global_step += 1;
                }
            }
            if let Some(recorder) = ops.recorder.as_deref_mut() {
                recorder.observe(i, &inputs, &result);
            }

            total_loss += result.loss;
            self.current_state = Some(result.final_state);

            if let Some(every) = verbose_every {
                if i % every == 0 && i != 0 {
                    let elapsed = start.elapsed().as_secs_f64();
                    info!(
                        "{}: epoch[{}/{}] avg loss:{:.3}, speed:{:.0} wps, time:{:.1}s",
                        self.name,
                        i,
                        epoch_size,
                        total_loss / (i + 1) as f64,
                        (i + 1) as f64 * words_per_window / elapsed.max(f64::EPSILON),
                        elapsed
                    );
                }
            }
        }

        let time = start.elapsed();
        let stats = RunStats {
            loss: total_loss / epoch_size as f64,
            time,
            words_per_sec: epoch_size as f64 * words_per_window / time.as_secs_f64().max(f64::EPSILON),
            windows: epoch_size,
        };
        if verbose_every.is_some() {
            info!(
                "{}: Epoch Summary: avg loss:{:.3}, perplexity:{:.3}, speed:{:.0} wps, time:{:.1}s",
                self.name,
                stats.loss,
                stats.perplexity(),
                stats.words_per_sec,
                stats.time.as_secs_f64()
            );
        }
        Ok(stats)
    }

    fn dropout_mask(&mut self, rows: usize, cols: usize) -> Option<Ten64> {
        let keep = self.keep_prob.filter(|&p| p < 1.0)?;
        let data = (0..rows * cols)
            .map(|_| {
                if self.rng.random::<f64>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            })
            .collect();
        Some(Tensor::new(vec![rows, cols], data))
    }

    fn window(
        &mut self,
        net: &Network,
        loss: &dyn Loss,
        inputs: &Ten64,
        targets: &Ten64,
        with_gradients: bool,
    ) -> Result<WindowResult> {
        let (steps, batch) = (self.num_steps, self.batch_size);
        net.input().check(inputs, steps, batch)?;
        let targets = net
            .target()
            .prepare(targets, steps, batch, net.output_width())?;

        let mut state = match &self.current_state {
            Some(s) => s.clone(),
            None => net.zero_state(batch),
        };
        net.check_state(&state, batch)?;

        // step inputs, [batch, width] each
        let ids: Vec<Vec<usize>> = match net.embedding() {
            Some(_) => (0..steps)
                .map(|t| inputs.outer(t).data.iter().map(|&v| v as usize).collect())
                .collect(),
            None => Vec::new(),
        };
        let mut lookups = Vec::with_capacity(ids.len());
        let step_inputs: Vec<Ten64> = match net.embedding() {
            Some(table) => ids
                .iter()
                .map(|step_ids| {
                    let (x, back) = backprop::embedding_lookup(table, step_ids);
                    lookups.push(back);
                    x
                })
                .collect(),
            None => {
                let width = net.input().step_width();
                (0..steps)
                    .map(|t| inputs.outer(t).reshape([batch, width]))
                    .collect()
            }
        };

        let cells = net.cells();
        let mut traces: Vec<Vec<LayerTrace<'_>>> = Vec::with_capacity(steps);
        let mut top_outputs = Vec::with_capacity(steps);
        for x_t in &step_inputs {
            let mut x = x_t.clone();
            let mut layers = Vec::with_capacity(cells.len());
            for (l, cell) in cells.iter().enumerate() {
                let input_mask = self.dropout_mask(batch, cell.input_size());
                if let Some(m) = &input_mask {
                    x = x.zip_map(m, |a, b| a * b);
                }
                let (out, next, back) = cell.step(&x, &state[l])?;
                state[l] = next;
                let output_mask = self.dropout_mask(batch, cell.output_size());
                x = match &output_mask {
                    Some(m) => out.zip_map(m, |a, b| a * b),
                    None => out,
                };
                layers.push(LayerTrace {
                    back,
                    input_mask,
                    output_mask,
                });
            }
            top_outputs.push(x);
            traces.push(layers);
        }

        let stacked = Ten64::vcat(&top_outputs);
        let (logits, projection_back) = match net.projection() {
            Some(p) => {
                let (out, back) = backprop::linear(&stacked, &p.weight, &p.bias);
                (out, Some(back))
            }
            None => (stacked.clone(), None),
        };

        let (loss_value, loss_back) = loss.forward(&logits, &targets)?;
        let final_state = state;

        if !with_gradients {
            drop(loss_back);
            return Ok(WindowResult {
                loss: loss_value,
                outputs: logits,
                final_state,
                gradients: None,
            });
        }

        let mut grads = net.zero_gradients();
        let d_logits = loss_back(1.0);
        drop(loss_back);

        let d_stacked = match projection_back {
            Some(back) => {
                let (dx, dw, db) = back(&d_logits);
                let offset = net.projection_offset();
                grads.tensors[offset].add_assign(&dw);
                grads.tensors[offset + 1].add_assign(&db);
                dx
            }
            None => d_logits,
        };

        let offsets = net.cell_offsets();
        let top_width = d_stacked.shape[1];
        let block = batch * top_width;
        let mut d_state: StackState = final_state.iter().map(CellState::zeros_like).collect();
        for t in (0..steps).rev() {
            let mut dh = Tensor::new(
                vec![batch, top_width],
                d_stacked.data[t * block..(t + 1) * block].to_vec(),
            );
            for l in (0..cells.len()).rev() {
                let trace = &traces[t][l];
                if let Some(m) = &trace.output_mask {
                    dh = dh.zip_map(m, |a, b| a * b);
                }
                let step = (trace.back)(&dh, &d_state[l]);
                for (k, g) in step.params.iter().enumerate() {
                    grads.tensors[offsets[l] + k].add_assign(g);
                }
                d_state[l] = step.state;
                dh = step.input;
                if let Some(m) = &trace.input_mask {
                    dh = dh.zip_map(m, |a, b| a * b);
                }
            }
            if let Some(scatter) = lookups.get(t) {
                scatter(&dh, &mut grads.tensors[0]);
            }
        }

        Ok(WindowResult {
            loss: loss_value,
            outputs: logits,
            final_state,
            gradients: Some(grads),
        })
    }
}
