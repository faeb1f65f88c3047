use super::{Cell, CellState, Initializer, StepGrads, StepOutput, check_input, d_tanh, split_cols, tanh};
use crate::error::Result;
use crate::tensors::{Ten64, WithGrad};
use rand::rngs::StdRng;

/// Elman cell: `h' = tanh([x, h] · W + b)`. The output is the new state.
#[derive(Debug, Clone)]
pub struct BasicRnnCell {
    input_size: usize,
    num_units: usize,
    kernel: WithGrad<Ten64>,
    bias: WithGrad<Ten64>,
}

impl BasicRnnCell {
    pub fn new(input_size: usize, num_units: usize, init: &Initializer, rng: &mut StdRng) -> Self {
        Self {
            input_size,
            num_units,
            kernel: init.sample([input_size + num_units, num_units], rng),
            bias: WithGrad::new(Ten64::zeros([num_units])),
        }
    }
}

impl Cell for BasicRnnCell {
    fn kind(&self) -> &'static str {
        "basic_rnn_cell"
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.num_units
    }

    fn zero_state(&self, batch_size: usize) -> CellState {
        CellState::Hidden(Ten64::zeros([batch_size, self.num_units]))
    }

    fn step<'a>(&'a self, input: &Ten64, state: &CellState) -> Result<StepOutput<'a>> {
        let batch = check_input(self.kind(), input, self.input_size)?;
        let h = state.expect_hidden(self.kind(), batch, self.num_units)?;

        let z = Ten64::hcat(&[input, h]);
        let out = tanh(&z.dot(&self.kernel.value).add_row(&self.bias.value));
        let activation = out.clone();

        let back = move |d_out: &Ten64, d_state: &CellState| {
            let mut dh = d_out.clone();
            dh.add_assign(d_state.hidden());
            let da = d_tanh(&dh, &activation);

            let dz = da.dot_t(&self.kernel.value);
            let (dx, dh_prev) = split_cols(&dz, self.input_size);

            StepGrads {
                input: dx,
                state: CellState::Hidden(dh_prev),
                params: vec![z.t_dot(&da), da.sum_rows()],
            }
        };

        Ok((out.clone(), CellState::Hidden(out), Box::new(back)))
    }

    fn params(&self) -> Vec<(&'static str, &WithGrad<Ten64>)> {
        vec![("kernel", &self.kernel), ("bias", &self.bias)]
    }

    fn params_mut(&mut self) -> Vec<&mut WithGrad<Ten64>> {
        vec![&mut self.kernel, &mut self.bias]
    }
}
