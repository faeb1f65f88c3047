//! Long short-term memory cell.
//!
//! # Equations
//!
//! ```text
//! [i, j, f, o] = [x, h] · W + b
//! c' = σ(f + forget_bias + w_f ⊙ c) ⊙ c + σ(i + w_i ⊙ c) ⊙ tanh(j)
//! c' = clip(c', -cell_clip, cell_clip)
//! m  = σ(o + w_o ⊙ c') ⊙ tanh(c')
//! h' = m · W_proj      (or m without projection)
//! ```
//!
//! The diagonal peephole weights `w_i`, `w_f`, `w_o` only exist with peepholes enabled.
//! The basic variant has neither peepholes, clipping nor projection; it shares this
//! implementation and differs only in its kind.
//!
//! # State
//! `(c, h)` with `c: [batch, num_units]` and `h: [batch, num_proj or num_units]`.

use super::{
    Cell, CellState, Initializer, StepGrads, StepOutput, add, blocks, check_input, d_sigmoid,
    d_tanh, mul, sigmoid, split_cols, tanh,
};
use crate::error::Result;
use crate::tensors::{Ten64, Tensor, WithGrad};
use rand::rngs::StdRng;

/// Optional behaviour of a full LSTM cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LstmOptions {
    pub forget_bias: f64,
    pub use_peepholes: bool,
    pub cell_clip: Option<f64>,
    pub num_proj: Option<usize>,
}

#[derive(Debug, Clone)]
struct Peepholes {
    input: WithGrad<Ten64>,
    forget: WithGrad<Ten64>,
    output: WithGrad<Ten64>,
}

#[derive(Debug, Clone)]
pub struct LstmCell {
    basic: bool,
    input_size: usize,
    num_units: usize,
    forget_bias: f64,
    cell_clip: Option<f64>,
    kernel: WithGrad<Ten64>,
    bias: WithGrad<Ten64>,
    peepholes: Option<Peepholes>,
    projection: Option<WithGrad<Ten64>>,
}

impl LstmCell {
    pub(crate) fn new(
        input_size: usize,
        num_units: usize,
        options: LstmOptions,
        init: &Initializer,
        rng: &mut StdRng,
    ) -> Self {
        let state_width = options.num_proj.unwrap_or(num_units);
        let kernel = init.sample([input_size + state_width, 4 * num_units], rng);
        let peepholes = options.use_peepholes.then(|| Peepholes {
            input: init.sample([num_units], rng),
            forget: init.sample([num_units], rng),
            output: init.sample([num_units], rng),
        });
        let projection = options.num_proj.map(|p| init.sample([num_units, p], rng));

        Self {
            basic: false,
            input_size,
            num_units,
            forget_bias: options.forget_bias,
            cell_clip: options.cell_clip,
            kernel,
            bias: WithGrad::new(Ten64::zeros([4 * num_units])),
            peepholes,
            projection,
        }
    }

    /// The LSTM without peepholes, clipping or projection.
    pub(crate) fn basic(
        input_size: usize,
        num_units: usize,
        forget_bias: f64,
        init: &Initializer,
        rng: &mut StdRng,
    ) -> Self {
        let options = LstmOptions {
            forget_bias,
            use_peepholes: false,
            cell_clip: None,
            num_proj: None,
        };
        Self {
            basic: true,
            ..Self::new(input_size, num_units, options, init, rng)
        }
    }

    fn state_width(&self) -> usize {
        self.projection
            .as_ref()
            .map_or(self.num_units, |p| p.value.shape[1])
    }
}

impl Cell for LstmCell {
    fn kind(&self) -> &'static str {
        if self.basic {
            "basic_lstm_cell"
        } else {
            "lstm_cell"
        }
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.state_width()
    }

    fn zero_state(&self, batch_size: usize) -> CellState {
        CellState::Lstm {
            c: Ten64::zeros([batch_size, self.num_units]),
            h: Ten64::zeros([batch_size, self.state_width()]),
        }
    }

    fn step<'a>(&'a self, input: &Ten64, state: &CellState) -> Result<StepOutput<'a>> {
        let batch = check_input(self.kind(), input, self.input_size)?;
        let (c_prev, h_prev) = state.expect_lstm(batch, self.num_units, self.state_width())?;
        let c_prev = c_prev.clone();

        let z = Ten64::hcat(&[input, h_prev]);
        let pre = z.dot(&self.kernel.value).add_row(&self.bias.value);
        let [i, j, f, o] = blocks::<4>(&pre, self.num_units);

        let forget_bias = self.forget_bias;
        let (ig, fg) = match &self.peepholes {
            Some(p) => (
                sigmoid(&add(&i, &c_prev.mul_row(&p.input.value))),
                sigmoid(&add(&f, &c_prev.mul_row(&p.forget.value)).map(|x| x + forget_bias)),
            ),
            None => (sigmoid(&i), sigmoid(&f.map(|x| x + forget_bias))),
        };
        let jg = tanh(&j);

        let c_raw = add(&mul(&fg, &c_prev), &mul(&ig, &jg));
        let c = match self.cell_clip {
            Some(clip) => c_raw.map(|x| x.clamp(-clip, clip)),
            None => c_raw.clone(),
        };

        let og = match &self.peepholes {
            Some(p) => sigmoid(&add(&o, &c.mul_row(&p.output.value))),
            None => sigmoid(&o),
        };
        let tc = tanh(&c);
        let m = mul(&og, &tc);
        let h = match &self.projection {
            Some(w) => m.dot(&w.value),
            None => m.clone(),
        };
        let next = CellState::Lstm {
            c: c.clone(),
            h: h.clone(),
        };

        let back = move |d_out: &Ten64, d_state: &CellState| {
            let (dc_next, dh_next) = match d_state {
                CellState::Lstm { c, h } => (c.clone(), h),
                CellState::Hidden(h) => (c_prev.zeros_like(), h),
            };
            let dh = add(d_out, dh_next);

            let mut params = Vec::with_capacity(7);
            let (dm, d_proj) = match &self.projection {
                Some(w) => (dh.dot_t(&w.value), Some(m.t_dot(&dh))),
                None => (dh, None),
            };

            let dog = mul(&dm, &tc);
            let mut dc = add(
                &dc_next,
                &Tensor::new(
                    dm.shape.clone(),
                    (0..dm.len())
                        .map(|k| dm.data[k] * og.data[k] * (1.0 - tc.data[k] * tc.data[k]))
                        .collect(),
                ),
            );
            let dao = d_sigmoid(&dog, &og);

            let mut d_peep_out = None;
            if let Some(p) = &self.peepholes {
                dc.add_assign(&dao.mul_row(&p.output.value));
                d_peep_out = Some(mul(&dao, &c).sum_rows());
            }

            if let Some(clip) = self.cell_clip {
                dc = dc.zip_map(&c_raw, |g, x| if x.abs() <= clip { g } else { 0.0 });
            }

            let dai = d_sigmoid(&mul(&dc, &jg), &ig);
            let daf = d_sigmoid(&mul(&dc, &c_prev), &fg);
            let daj = d_tanh(&mul(&dc, &ig), &jg);
            let mut dc_prev = mul(&dc, &fg);

            let mut d_peep_in = None;
            if let Some(p) = &self.peepholes {
                dc_prev.add_assign(&dai.mul_row(&p.input.value));
                dc_prev.add_assign(&daf.mul_row(&p.forget.value));
                d_peep_in = Some((mul(&dai, &c_prev).sum_rows(), mul(&daf, &c_prev).sum_rows()));
            }

            let da = Ten64::hcat(&[&dai, &daj, &daf, &dao]);
            let dz = da.dot_t(&self.kernel.value);
            let (dx, dh_prev) = split_cols(&dz, self.input_size);

            params.push(z.t_dot(&da));
            params.push(da.sum_rows());
            if let (Some((dw_i, dw_f)), Some(dw_o)) = (d_peep_in, d_peep_out) {
                params.extend([dw_i, dw_f, dw_o]);
            }
            params.extend(d_proj);

            StepGrads {
                input: dx,
                state: CellState::Lstm {
                    c: dc_prev,
                    h: dh_prev,
                },
                params,
            }
        };

        Ok((h, next, Box::new(back)))
    }

    fn params(&self) -> Vec<(&'static str, &WithGrad<Ten64>)> {
        let mut params = vec![("kernel", &self.kernel), ("bias", &self.bias)];
        if let Some(p) = &self.peepholes {
            params.push(("w_i_diag", &p.input));
            params.push(("w_f_diag", &p.forget));
            params.push(("w_o_diag", &p.output));
        }
        if let Some(w) = &self.projection {
            params.push(("projection/kernel", w));
        }
        params
    }

    fn params_mut(&mut self) -> Vec<&mut WithGrad<Ten64>> {
        let mut params = vec![&mut self.kernel, &mut self.bias];
        if let Some(p) = &mut self.peepholes {
            params.push(&mut p.input);
            params.push(&mut p.forget);
            params.push(&mut p.output);
        }
        if let Some(w) = &mut self.projection {
            params.push(w);
        }
        params
    }
}
