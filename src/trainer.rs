//! Training runs.
//!
//! A [`Trainer`] pairs an unrolled training model with an [`Optimizer`]. Each epoch
//! starts from a zero state and updates the shared network after every window.
//!
//! The learning rate follows a step decay:
//!
//! ```text
//! lr(epoch) = learning_rate * lr_decay ^ max(epoch + 1 - decay_after, 0)
//! ```

use crate::data::Feeder;
use crate::error::{Result, RnnError};
use crate::loss::Loss;
use crate::model::{RnnModel, RunOps, RunStats};
use crate::network::Network;
use crate::optim::{Clipper, Optimizer, OptimizerKind};
use serde::{Deserialize, Serialize};

fn default_learning_rate() -> f64 {
    1.0
}

fn default_lr_decay() -> f64 {
    1.0
}

fn optimizer_from_name_or_table<'de, D>(
    deserializer: D,
) -> std::result::Result<OptimizerKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Name(String),
        Table(OptimizerKind),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        Repr::Table(kind) => Ok(kind),
    }
}

/// Hyper-parameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub num_steps: usize,
    /// Dropout keep probability; `None` disables dropout.
    #[serde(default)]
    pub keep_prob: Option<f64>,
    /// Either a tagged table (`{"type": "adam", "beta1": 0.8}`) or a plain name such
    /// as `"Adam"`.
    #[serde(default, deserialize_with = "optimizer_from_name_or_table")]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub clipper: Option<Clipper>,
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
    /// Epochs trained at the initial rate before decay kicks in.
    #[serde(default)]
    pub decay_after: usize,
}

impl TrainerConfig {
    pub fn new(batch_size: usize, num_steps: usize) -> Self {
        Self {
            batch_size,
            num_steps,
            keep_prob: None,
            optimizer: OptimizerKind::default(),
            learning_rate: default_learning_rate(),
            clipper: None,
            lr_decay: default_lr_decay(),
            decay_after: 0,
        }
    }

    pub fn keep_prob(mut self, keep_prob: f64) -> Self {
        self.keep_prob = Some(keep_prob);
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn clipper(mut self, clipper: Clipper) -> Self {
        self.clipper = Some(clipper);
        self
    }

    pub fn lr_decay(mut self, lr_decay: f64, decay_after: usize) -> Self {
        self.lr_decay = lr_decay;
        self.decay_after = decay_after;
        self
    }

    /// Learning rate used during `epoch` (0-based).
    pub fn learning_rate_for(&self, epoch: usize) -> f64 {
        let exponent = (epoch + 1).saturating_sub(self.decay_after);
        self.learning_rate * self.lr_decay.powi(exponent as i32)
    }
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainerConfig,
    model: RnnModel,
    optimizer: Optimizer,
}

impl Trainer {
    pub(crate) fn new(config: TrainerConfig, model: RnnModel) -> Result<Self> {
        if !(config.lr_decay > 0.0) {
            return Err(RnnError::InvalidConfig(format!(
                "lr_decay must be positive, got {}",
                config.lr_decay
            )));
        }
        let optimizer = Optimizer::new(config.optimizer, config.learning_rate, config.clipper)?;
        Ok(Self {
            config,
            model,
            optimizer,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &RnnModel {
        &self.model
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Applies the decayed learning rate for `epoch` and returns it.
    pub fn begin_epoch(&mut self, epoch: usize) -> f64 {
        let lr = self.config.learning_rate_for(epoch);
        self.optimizer.set_learning_rate(lr);
        lr
    }

    /// Trains over `epoch_size` windows from a zero state.
    pub fn train_one_epoch(
        &mut self,
        net: &mut Network,
        loss: &dyn Loss,
        feeder: &mut dyn Feeder,
        epoch_size: usize,
        verbose: bool,
    ) -> Result<RunStats> {
        self.model.reset_state();
        let ops = RunOps {
            optimizer: Some(&mut self.optimizer),
            recorder: None,
        };
        let verbose_every = verbose.then(|| (epoch_size / 10).max(1));
        self.model.run(net, loss, feeder, epoch_size, ops, verbose_every)
    }
}
