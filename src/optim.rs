//! Optimizers and gradient clipping.
//!
//! An [`Optimizer`] keeps one slot set per parameter (momentum accumulators, moment
//! estimates) and applies an update rule from [`crate::backprop`] after optional
//! clipping. Slots are created lazily on the first update so the optimizer never needs
//! to know the network's shapes up front.

use crate::backprop;
use crate::error::{Result, RnnError};
use crate::network::Gradients;
use crate::tensors::{Ten64, WithGrad};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

fn default_momentum() -> f64 {
    0.9
}

fn default_initial_accumulator() -> f64 {
    0.1
}

fn default_decay() -> f64 {
    0.9
}

fn default_rms_epsilon() -> f64 {
    1e-10
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_epsilon() -> f64 {
    1e-8
}

/// Update rule and its hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    GradientDescent,
    Momentum {
        #[serde(default = "default_momentum")]
        momentum: f64,
    },
    Adagrad {
        #[serde(default = "default_initial_accumulator")]
        initial_accumulator: f64,
    },
    #[serde(rename = "rms_prop")]
    RmsProp {
        #[serde(default = "default_decay")]
        decay: f64,
        #[serde(default = "default_rms_epsilon")]
        epsilon: f64,
    },
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_adam_epsilon")]
        epsilon: f64,
    },
}

impl FromStr for OptimizerKind {
    type Err = RnnError;

    /// Parses the optimizer names used by common training scripts, with default
    /// hyper-parameters.
    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "gradientdescent" | "gradient_descent" | "sgd" => OptimizerKind::GradientDescent,
            "momentum" => OptimizerKind::Momentum {
                momentum: default_momentum(),
            },
            "adagrad" => OptimizerKind::Adagrad {
                initial_accumulator: default_initial_accumulator(),
            },
            "rmsprop" | "rms_prop" => OptimizerKind::RmsProp {
                decay: default_decay(),
                epsilon: default_rms_epsilon(),
            },
            "adam" => OptimizerKind::Adam {
                beta1: default_beta1(),
                beta2: default_beta2(),
                epsilon: default_adam_epsilon(),
            },
            _ => {
                return Err(RnnError::InvalidConfig(format!("unknown optimizer `{s}`")));
            }
        };
        Ok(kind)
    }
}

impl OptimizerKind {
    /// Checks the hyper-parameters.
    ///
    /// Accumulator-based rules divide by the square root of their accumulator, so a
    /// zero accumulator or offset would turn a zero gradient into `0 / 0`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str, value: f64| -> Result<()> {
            Err(RnnError::InvalidConfig(format!("{what} out of range, got {value}")))
        };
        match *self {
            OptimizerKind::GradientDescent => Ok(()),
            OptimizerKind::Momentum { momentum } if !(0.0..1.0).contains(&momentum) => {
                invalid("momentum", momentum)
            }
            OptimizerKind::Adagrad {
                initial_accumulator,
            } if !(initial_accumulator > 0.0 && initial_accumulator.is_finite()) => {
                invalid("initial accumulator", initial_accumulator)
            }
            OptimizerKind::RmsProp { decay, .. } if !(0.0..1.0).contains(&decay) => {
                invalid("rmsprop decay", decay)
            }
            OptimizerKind::RmsProp { epsilon, .. } if !(epsilon > 0.0 && epsilon.is_finite()) => {
                invalid("rmsprop epsilon", epsilon)
            }
            OptimizerKind::Adam { beta1, .. } if !(0.0..1.0).contains(&beta1) => {
                invalid("adam beta1", beta1)
            }
            OptimizerKind::Adam { beta2, .. } if !(0.0..1.0).contains(&beta2) => {
                invalid("adam beta2", beta2)
            }
            OptimizerKind::Adam { epsilon, .. } if !(epsilon > 0.0 && epsilon.is_finite()) => {
                invalid("adam epsilon", epsilon)
            }
            _ => Ok(()),
        }
    }
}

/// Gradient clipping applied before each update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clipper {
    /// Rescales all gradients together when their global norm exceeds the bound.
    GlobalNorm(f64),
    /// Rescales each gradient tensor whose own norm exceeds the bound.
    Norm(f64),
    /// Clamps every element to `[-bound, bound]`.
    Value(f64),
}

impl Clipper {
    fn bound(&self) -> f64 {
        match *self {
            Clipper::GlobalNorm(b) | Clipper::Norm(b) | Clipper::Value(b) => b,
        }
    }

    /// Clips in place; `global_norm` is the norm of the unclipped gradients.
    pub fn clip(&self, grads: &mut Gradients, global_norm: f64) {
        match *self {
            Clipper::GlobalNorm(max) => {
                if global_norm > max {
                    let factor = max / global_norm;
                    for g in &mut grads.tensors {
                        *g = g.scale(factor);
                    }
                }
            }
            Clipper::Norm(max) => {
                for g in &mut grads.tensors {
                    let norm = g.sq_norm().sqrt();
                    if norm > max {
                        *g = g.scale(max / norm);
                    }
                }
            }
            Clipper::Value(max) => {
                for g in &mut grads.tensors {
                    *g = g.map(|x| x.clamp(-max, max));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Slots {
    first: Ten64,
    second: Ten64,
}

impl Slots {
    fn new(kind: &OptimizerKind, like: &Ten64) -> Self {
        let empty = || Ten64::zeros([0]);
        match *kind {
            OptimizerKind::GradientDescent => Slots {
                first: empty(),
                second: empty(),
            },
            OptimizerKind::Momentum { .. } | OptimizerKind::RmsProp { .. } => Slots {
                first: like.zeros_like(),
                second: empty(),
            },
            OptimizerKind::Adagrad {
                initial_accumulator,
            } => Slots {
                first: Ten64::filled(like.shape.clone(), initial_accumulator),
                second: empty(),
            },
            OptimizerKind::Adam { .. } => Slots {
                first: like.zeros_like(),
                second: like.zeros_like(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    clipper: Option<Clipper>,
    slots: Vec<Slots>,
    iterations: u64,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: f64, clipper: Option<Clipper>) -> Result<Self> {
        if !(learning_rate > 0.0) {
            return Err(RnnError::InvalidConfig(format!(
                "learning rate must be positive, got {learning_rate}"
            )));
        }
        kind.validate()?;
        if let Some(c) = clipper {
            if !(c.bound() > 0.0) {
                return Err(RnnError::InvalidConfig(format!(
                    "clipping bound must be positive, got {}",
                    c.bound()
                )));
            }
        }
        Ok(Self {
            kind,
            learning_rate,
            clipper,
            slots: Vec::new(),
            iterations: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Number of updates applied.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Clips `grads` and applies one update to `params`.
    ///
    /// # Returns
    /// The global norm of the gradients before clipping.
    ///
    /// # Errors
    /// Fails if the gradients do not line up with the parameters.
    pub fn apply(&mut self, params: Vec<&mut WithGrad<Ten64>>, mut grads: Gradients) -> Result<f64> {
        if params.len() != grads.len() {
            return Err(RnnError::InvalidState(format!(
                "{} gradients for {} parameters",
                grads.len(),
                params.len()
            )));
        }
        if let Some((p, g)) = params
            .iter()
            .zip(&grads.tensors)
            .find(|(p, g)| p.value.shape != g.shape)
        {
            return Err(RnnError::ShapeMismatch {
                context: "gradient",
                expected: p.value.shape.clone(),
                got: g.shape.clone(),
            });
        }

        let norm = grads.global_norm();
        if let Some(clipper) = &self.clipper {
            clipper.clip(&mut grads, norm);
        }

        self.iterations += 1;
        let lr = self.learning_rate;
        for (idx, (param, grad)) in params.into_iter().zip(grads.tensors).enumerate() {
            if self.slots.len() <= idx {
                self.slots.push(Slots::new(&self.kind, &param.value));
            }
            param.grad.add_assign(&grad);
            let slots = &mut self.slots[idx];
            match self.kind {
                OptimizerKind::GradientDescent => backprop::sgd(param, lr),
                OptimizerKind::Momentum { momentum } => {
                    backprop::momentum(param, &mut slots.first, lr, momentum)
                }
                OptimizerKind::Adagrad { .. } => backprop::adagrad(param, &mut slots.first, lr),
                OptimizerKind::RmsProp { decay, epsilon } => {
                    backprop::rmsprop(param, &mut slots.first, lr, decay, epsilon)
                }
                OptimizerKind::Adam {
                    beta1,
                    beta2,
                    epsilon,
                } => backprop::adam(
                    param,
                    &mut slots.first,
                    &mut slots.second,
                    self.iterations,
                    lr,
                    (beta1, beta2),
                    epsilon,
                ),
            }
        }
        Ok(norm)
    }
}
