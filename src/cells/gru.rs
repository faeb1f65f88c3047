//! Gated recurrent unit.
//!
//! ```text
//! [r, u] = σ([x, h] · W_g + b_g)
//! c      = tanh([x, r ⊙ h] · W_c + b_c)
//! h'     = u ⊙ h + (1 - u) ⊙ c
//! ```
//!
//! The gate bias starts at `1.0` so a fresh cell leans towards remembering.

use super::{
    Cell, CellState, Initializer, StepGrads, StepOutput, add, check_input, d_sigmoid, d_tanh, mul,
    sigmoid, split_cols, tanh,
};
use crate::error::Result;
use crate::tensors::{Ten64, Tensor, WithGrad};
use rand::rngs::StdRng;

#[derive(Debug, Clone)]
pub struct GruCell {
    input_size: usize,
    num_units: usize,
    gate_kernel: WithGrad<Ten64>,
    gate_bias: WithGrad<Ten64>,
    candidate_kernel: WithGrad<Ten64>,
    candidate_bias: WithGrad<Ten64>,
}

impl GruCell {
    pub fn new(input_size: usize, num_units: usize, init: &Initializer, rng: &mut StdRng) -> Self {
        let rows = input_size + num_units;
        Self {
            input_size,
            num_units,
            gate_kernel: init.sample([rows, 2 * num_units], rng),
            gate_bias: WithGrad::new(Ten64::filled([2 * num_units], 1.0)),
            candidate_kernel: init.sample([rows, num_units], rng),
            candidate_bias: WithGrad::new(Ten64::zeros([num_units])),
        }
    }
}

impl Cell for GruCell {
    fn kind(&self) -> &'static str {
        "gru_cell"
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
        let h = state.expect_hidden(self.kind(), batch, self.num_units)?.clone();
        let n = self.num_units;

        let z = Ten64::hcat(&[input, &h]);
        let gates = sigmoid(&z.dot(&self.gate_kernel.value).add_row(&self.gate_bias.value));
        let (r, u) = split_cols(&gates, n);

        let zc = Ten64::hcat(&[input, &mul(&r, &h)]);
        let c = tanh(&zc.dot(&self.candidate_kernel.value).add_row(&self.candidate_bias.value));

        let new_h = Tensor::new(
            h.shape.clone(),
            (0..h.len())
                .map(|i| u.data[i] * h.data[i] + (1.0 - u.data[i]) * c.data[i])
                .collect(),
        );

        let back = move |d_out: &Ten64, d_state: &CellState| {
            let dh = add(d_out, d_state.hidden());

            let du = Tensor::new(
                dh.shape.clone(),
                (0..dh.len())
                    .map(|i| dh.data[i] * (h.data[i] - c.data[i]))
                    .collect(),
            );
            let dc = dh.zip_map(&u, |g, u| g * (1.0 - u));
            let mut dh_prev = mul(&dh, &u);

            let dac = d_tanh(&dc, &c);
            let dzc = dac.dot_t(&self.candidate_kernel.value);
            let (dx_c, drh) = split_cols(&dzc, self.input_size);

            let dr = mul(&drh, &h);
            dh_prev.add_assign(&mul(&drh, &r));

            let dag = d_sigmoid(&Ten64::hcat(&[&dr, &du]), &gates);
            let dz = dag.dot_t(&self.gate_kernel.value);
            let (dx_g, dh_g) = split_cols(&dz, self.input_size);
            dh_prev.add_assign(&dh_g);

            StepGrads {
                input: add(&dx_c, &dx_g),
                state: CellState::Hidden(dh_prev),
                params: vec![
                    z.t_dot(&dag),
                    dag.sum_rows(),
                    zc.t_dot(&dac),
                    dac.sum_rows(),
                ],
            }
        };

        Ok((new_h.clone(), CellState::Hidden(new_h), Box::new(back)))
    }

    fn params(&self) -> Vec<(&'static str, &WithGrad<Ten64>)> {
        vec![
            ("gates/kernel", &self.gate_kernel),
            ("gates/bias", &self.gate_bias),
            ("candidate/kernel", &self.candidate_kernel),
            ("candidate/bias", &self.candidate_bias),
        ]
    }

    fn params_mut(&mut self) -> Vec<&mut WithGrad<Ten64>> {
        vec![
            &mut self.gate_kernel,
            &mut self.gate_bias,
            &mut self.candidate_kernel,
            &mut self.candidate_bias,
        ]
    }
}
