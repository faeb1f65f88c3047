//! The network builder and session owner.
//!
//! # Lifecycle
//!
//! 1. **Declare**: [`Rnn::set_input`], [`Rnn::set_output`], [`Rnn::set_target`],
//!    [`Rnn::set_loss_func`] and [`Rnn::add_cell`] describe the network. They are
//!    rejected once the network is compiled.
//! 2. **Compile**: [`Rnn::compile`] checks the declarations and creates every
//!    parameter.
//! 3. **Unroll**: [`Rnn::unroll`], [`Rnn::add_trainer`], [`Rnn::add_validator`] and
//!    [`Rnn::add_evaluator`] create models sharing the compiled parameters. They are
//!    rejected once the network is finalized.
//! 4. **Run**: [`Rnn::train`], [`Rnn::evaluate`], [`Rnn::save`] and [`Rnn::restore`]
//!    finalize the network on first use and open a session that restores the latest
//!    checkpoint of the log directory.
//!
//! # Example
//!
//! ```rust,no_run
//! use briny_rnn::prelude::*;
//!
//! fn main() -> briny_rnn::error::Result<()> {
//!     let ids: Vec<usize> = (0..10_000).map(|i| i % 50).collect();
//!
//!     let mut rnn = Rnn::new("ptb").with_logdir("runs/ptb");
//!     rnn.set_input(&[], DType::Int32, Some(50), Some(32))?;
//!     rnn.set_output(&[50], DType::Float32)?;
//!     rnn.set_target(&[], DType::Int32)?;
//!     rnn.set_loss_func(Box::new(SequenceLoss))?;
//!     rnn.add_cell(CellSpec::basic_lstm(64))?;
//!     rnn.compile(true)?;
//!     rnn.add_trainer(TrainerConfig::new(20, 20).clipper(Clipper::GlobalNorm(5.0)))?;
//!
//!     let mut train = SequenceProducer::new(&ids, 20, 20)?;
//!     let epoch_size = train.epoch_size();
//!     rnn.train(&mut train, epoch_size, 2, None, true)?;
//!     rnn.save(None)?;
//!     Ok(())
//! }
//! ```

use crate::cells::{CellSpec, Initializer};
use crate::config::{EvaluatorConfig, RnnConfig};
use crate::data::Feeder;
use crate::error::{Result, RnnError};
use crate::evaluator::{EvalOptions, Evaluation, Evaluator};
use crate::loss::Loss;
use crate::model::{RnnModel, RunOps, RunStats};
use crate::modelio::{DEFAULT_SAVE_MODEL_SECS, Supervisor};
use crate::network::Network;
use crate::shapes::{DType, InputDecl, OutputDecl, TargetDecl};
use crate::trainer::{Trainer, TrainerConfig};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::path::{Path, PathBuf};

/// Held-out data checked after every training epoch.
pub struct Validation<'a> {
    pub feeder: &'a mut dyn Feeder,
    pub epoch_size: usize,
}

/// Per-epoch outcome of [`Rnn::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: RunStats,
    /// Validation loss, when validation data was given.
    pub validation_loss: Option<f64>,
}

pub struct Rnn {
    name: String,
    initializer: Initializer,
    logdir: PathBuf,
    save_model_secs: Option<u64>,
    input: Option<InputDecl>,
    output: Option<OutputDecl>,
    target: Option<TargetDecl>,
    loss: Option<Box<dyn Loss>>,
    cells: Vec<CellSpec>,
    network: Option<Network>,
    models: Vec<String>,
    trainer: Option<Trainer>,
    validator: Option<Evaluator>,
    evaluator: Option<Evaluator>,
    supervisor: Option<Supervisor>,
    rng: StdRng,
}

impl Rnn {
    /// A network named `name`, logging to `./<name>`, with `U(-0.1, 0.1)` weights.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            logdir: PathBuf::from(&name),
            name,
            initializer: Initializer::default(),
            save_model_secs: Some(DEFAULT_SAVE_MODEL_SECS),
            input: None,
            output: None,
            target: None,
            loss: None,
            cells: Vec::new(),
            network: None,
            models: Vec::new(),
            trainer: None,
            validator: None,
            evaluator: None,
            supervisor: None,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_logdir(mut self, logdir: impl Into<PathBuf>) -> Self {
        self.logdir = logdir.into();
        self
    }

    /// Makes parameter initialization and dropout reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// `None` disables automatic saves during training.
    pub fn with_save_model_secs(mut self, secs: Option<u64>) -> Self {
        self.save_model_secs = secs;
        self
    }

    /// Builds, compiles and attaches every model described by a configuration.
    pub fn from_config(config: &RnnConfig) -> Result<Self> {
        let mut rnn = Rnn::new(config.name.clone())
            .with_initializer(config.initializer)
            .with_save_model_secs(config.save_model_secs);
        if let Some(logdir) = &config.logdir {
            rnn = rnn.with_logdir(logdir);
        }
        if let Some(seed) = config.seed {
            rnn = rnn.with_seed(seed);
        }

        let input = &config.input;
        rnn.set_input(&input.shape, input.dtype, input.vocab_size, input.embedding_size)?;
        rnn.set_output(&config.output.shape, config.output.dtype)?;
        rnn.set_target(&config.target.shape, config.target.dtype)?;
        rnn.set_loss_func(config.loss.build())?;
        for cell in &config.cells {
            rnn.add_cell(cell.clone())?;
        }

        rnn.compile(config.evaluator.is_none())?;
        if let Some(trainer) = &config.trainer {
            rnn.add_trainer(trainer.clone())?;
        }
        if let Some(v) = &config.validator {
            rnn.add_validator(v.batch_size, v.num_steps)?;
        }
        if let Some(e) = &config.evaluator {
            rnn.add_evaluator(e.clone())?;
        }
        Ok(rnn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    pub fn is_compiled(&self) -> bool {
        self.network.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.supervisor.is_some()
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    pub fn network_mut(&mut self) -> Option<&mut Network> {
        self.network.as_mut()
    }

    pub fn trainer(&self) -> Option<&Trainer> {
        self.trainer.as_ref()
    }

    pub fn validator(&self) -> Option<&Evaluator> {
        self.validator.as_ref()
    }

    pub fn evaluator(&self) -> Option<&Evaluator> {
        self.evaluator.as_ref()
    }

    /// Names of every model unrolled so far.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn global_step(&self) -> u64 {
        self.network.as_ref().map_or(0, |n| n.global_step)
    }

    fn ensure_declaring(&self) -> Result<()> {
        if self.is_compiled() {
            return Err(RnnError::AlreadyCompiled);
        }
        Ok(())
    }

    fn ensure_unrolling(&self) -> Result<()> {
        if !self.is_compiled() {
            return Err(RnnError::NotCompiled);
        }
        if self.is_finalized() {
            return Err(RnnError::Finalized);
        }
        Ok(())
    }

    /// Declares the per-example input shape.
    ///
    /// Integer inputs are word ids and need a vocabulary and an embedding size.
    pub fn set_input(
        &mut self,
        shape: &[usize],
        dtype: DType,
        vocab_size: Option<usize>,
        embedding_size: Option<usize>,
    ) -> Result<()> {
        self.ensure_declaring()?;
        self.input = Some(InputDecl {
            shape: shape.to_vec(),
            dtype,
            vocab_size,
            embedding_size,
        });
        Ok(())
    }

    pub fn set_output(&mut self, shape: &[usize], dtype: DType) -> Result<()> {
        self.ensure_declaring()?;
        self.output = Some(OutputDecl {
            shape: shape.to_vec(),
            dtype,
        });
        Ok(())
    }

    pub fn set_target(&mut self, shape: &[usize], dtype: DType) -> Result<()> {
        self.ensure_declaring()?;
        self.target = Some(TargetDecl {
            shape: shape.to_vec(),
            dtype,
        });
        Ok(())
    }

    pub fn set_loss_func(&mut self, loss: Box<dyn Loss>) -> Result<()> {
        self.ensure_declaring()?;
        self.loss = Some(loss);
        Ok(())
    }

    /// Appends a layer on top of the stack.
    pub fn add_cell(&mut self, cell: CellSpec) -> Result<()> {
        self.ensure_declaring()?;
        self.cells.push(cell);
        Ok(())
    }

    /// Checks the declarations and creates the parameters.
    ///
    /// With `evaluate`, the default evaluator (batch 1, one step per window, recording
    /// everything) is attached. Compiling twice logs a warning and does nothing.
    pub fn compile(&mut self, evaluate: bool) -> Result<()> {
        if self.is_compiled() {
            warn!("{} is already compiled", self.name);
            return Ok(());
        }
        let input = self.input.clone().ok_or(RnnError::MissingDeclaration(
            "input shape or dtype is missing, call set_input first",
        ))?;
        let output = self.output.clone().ok_or(RnnError::MissingDeclaration(
            "output shape or dtype is missing, call set_output first",
        ))?;
        let target = self.target.clone().ok_or(RnnError::MissingDeclaration(
            "target shape or dtype is missing, call set_target first",
        ))?;
        let loss = self.loss.as_ref().ok_or(RnnError::MissingDeclaration(
            "loss function is missing, call set_loss_func first",
        ))?;
        if self.cells.is_empty() {
            return Err(RnnError::MissingDeclaration(
                "the cell stack is empty, call add_cell first",
            ));
        }
        if target.dtype != loss.target_dtype() {
            return Err(RnnError::InvalidConfig(format!(
                "{} expects {} targets, declared {}",
                loss.name(),
                loss.target_dtype(),
                target.dtype
            )));
        }

        let network = Network::build(
            &self.name,
            input,
            output,
            target,
            &self.cells,
            &self.initializer,
            &mut self.rng,
        )?;
        info!(
            "compiled {}: {} layers, {} parameters{}{}",
            self.name,
            network.cells().len(),
            network.num_params(),
            if network.has_embedding() { ", embedding" } else { "" },
            if network.has_projection() { ", projection" } else { "" },
        );
        for (name, w) in network.named_params() {
            debug!("{name}: {:?}", w.value.shape);
        }
        self.network = Some(network);

        if evaluate {
            let model = self.new_model(1, 1, None, "Evaluator")?;
            self.evaluator = Some(Evaluator::new(model, 1, true, true, true));
        }
        Ok(())
    }

    fn new_model(
        &mut self,
        batch_size: usize,
        num_steps: usize,
        keep_prob: Option<f64>,
        name: &str,
    ) -> Result<RnnModel> {
        let mut unique = name.to_string();
        let mut k = 0;
        while self.models.contains(&unique) {
            k += 1;
            unique = format!("{name}_{k}");
        }
        let model = RnnModel::new(unique.clone(), batch_size, num_steps, keep_prob, self.rng.next_u64())?;
        self.models.push(unique);
        Ok(model)
    }

    /// Creates a model over the shared parameters.
    ///
    /// Repeated names get a `_<k>` suffix.
    pub fn unroll(
        &mut self,
        batch_size: usize,
        num_steps: usize,
        keep_prob: Option<f64>,
        name: &str,
    ) -> Result<RnnModel> {
        self.ensure_unrolling()?;
        self.new_model(batch_size, num_steps, keep_prob, name)
    }

    /// Attaches the training model. A second trainer is ignored with a warning.
    pub fn add_trainer(&mut self, config: TrainerConfig) -> Result<()> {
        self.ensure_unrolling()?;
        if self.trainer.is_some() {
            warn!("{} already has a trainer", self.name);
            return Ok(());
        }
        let model = self.new_model(config.batch_size, config.num_steps, config.keep_prob, "Trainer")?;
        self.trainer = Some(Trainer::new(config, model)?);
        Ok(())
    }

    /// Attaches the validation model. A second validator is ignored with a warning.
    pub fn add_validator(&mut self, batch_size: usize, num_steps: usize) -> Result<()> {
        self.ensure_unrolling()?;
        if self.validator.is_some() {
            warn!("{} already has a validator", self.name);
            return Ok(());
        }
        let model = self.new_model(batch_size, num_steps, None, "Validator")?;
        self.validator = Some(Evaluator::validator(model));
        Ok(())
    }

    /// Attaches the evaluation model; it runs one step per window.
    pub fn add_evaluator(&mut self, config: EvaluatorConfig) -> Result<()> {
        self.ensure_unrolling()?;
        if self.evaluator.is_some() {
            return Err(RnnError::EvaluatorExists);
        }
        let model = self.new_model(config.batch_size, 1, None, "Evaluator")?;
        self.evaluator = Some(Evaluator::new(
            model,
            config.record_every,
            config.log_state,
            config.log_input,
            config.log_output,
        ));
        Ok(())
    }

    /// Freezes the model set and creates the supervisor.
    ///
    /// Returns `false` with a warning when already finalized.
    pub fn finalize(&mut self) -> bool {
        if self.is_finalized() {
            warn!("{} is already finalized", self.name);
            return false;
        }
        self.supervisor = Some(Supervisor::new(self.logdir.clone(), self.save_model_secs));
        true
    }

    /// Finalizes if needed and opens the session.
    fn open_session(&mut self) -> Result<()> {
        if !self.is_compiled() {
            return Err(RnnError::NotCompiled);
        }
        if !self.is_finalized() {
            self.finalize();
        }
        if let (Some(supervisor), Some(net)) = (self.supervisor.as_mut(), self.network.as_mut()) {
            supervisor.managed_session(net)?;
        }
        Ok(())
    }

    /// Runs a model produced by [`Rnn::unroll`] without updating parameters.
    pub fn run(
        &mut self,
        model: &mut RnnModel,
        feeder: &mut dyn Feeder,
        epoch_size: usize,
        verbose_every: Option<usize>,
    ) -> Result<RunStats> {
        self.open_session()?;
        let (Some(net), Some(loss)) = (self.network.as_mut(), self.loss.as_deref()) else {
            return Err(RnnError::NotCompiled);
        };
        model.run(net, loss, feeder, epoch_size, RunOps::default(), verbose_every)
    }

    /// Trains for `epoch_num` epochs of `epoch_size` windows each.
    ///
    /// Each epoch starts from a zero state at the decayed learning rate and is followed
    /// by a validation pass when `validation` is given.
    pub fn train(
        &mut self,
        feeder: &mut dyn Feeder,
        epoch_size: usize,
        epoch_num: usize,
        mut validation: Option<Validation<'_>>,
        verbose: bool,
    ) -> Result<Vec<EpochSummary>> {
        if !self.is_compiled() {
            return Err(RnnError::NotCompiled);
        }
        if self.trainer.is_none() {
            return Err(RnnError::NoTrainer);
        }
        if validation.is_some() && self.validator.is_none() {
            return Err(RnnError::NoValidator);
        }
        self.open_session()?;

        let Rnn {
            name,
            network,
            loss,
            trainer,
            validator,
            supervisor,
            ..
        } = self;
        let (Some(net), Some(loss), Some(trainer)) =
            (network.as_mut(), loss.as_deref(), trainer.as_mut())
        else {
            return Err(RnnError::NotCompiled);
        };

        let mut history = Vec::with_capacity(epoch_num);
        for epoch in 0..epoch_num {
            let learning_rate = trainer.begin_epoch(epoch);
            if verbose {
                info!("{name}: epoch {}/{epoch_num}, learning rate {learning_rate:.4}", epoch + 1);
            }
            let stats = trainer.train_one_epoch(net, loss, feeder, epoch_size, verbose)?;

            let validation_loss = match (validation.as_mut(), validator.as_mut()) {
                (Some(v), Some(validator)) => {
                    let options = EvalOptions::default();
                    let eval = validator.evaluate(net, loss, &mut *v.feeder, v.epoch_size, options)?;
                    Some(eval.loss)
                }
                _ => None,
            };

            match validation_loss {
                Some(valid) => info!(
                    "{name}: epoch {} train perplexity {:.3}, valid perplexity {:.3}",
                    epoch + 1,
                    stats.perplexity(),
                    valid.exp()
                ),
                None => info!(
                    "{name}: epoch {} train perplexity {:.3}",
                    epoch + 1,
                    stats.perplexity()
                ),
            }

            if let Some(supervisor) = supervisor.as_mut() {
                supervisor.maybe_autosave(net)?;
            }
            history.push(EpochSummary {
                epoch,
                learning_rate,
                train: stats,
                validation_loss,
            });
        }
        Ok(history)
    }

    /// Runs the evaluator over `epoch_size` windows and writes its records to `logdir`
    /// (default `<logdir>/evaluate`).
    pub fn evaluate(
        &mut self,
        feeder: &mut dyn Feeder,
        epoch_size: usize,
        logdir: Option<&Path>,
    ) -> Result<Evaluation> {
        if !self.is_compiled() {
            return Err(RnnError::NotCompiled);
        }
        if self.evaluator.is_none() {
            return Err(RnnError::NoEvaluator);
        }
        self.open_session()?;

        let default_dir = self.logdir.join("evaluate");
        let options = EvalOptions {
            record: true,
            verbose: true,
            logdir: Some(logdir.unwrap_or(default_dir.as_path())),
        };
        let (Some(net), Some(loss), Some(evaluator)) = (
            self.network.as_mut(),
            self.loss.as_deref(),
            self.evaluator.as_mut(),
        ) else {
            return Err(RnnError::NoEvaluator);
        };
        evaluator.evaluate(net, loss, feeder, epoch_size, options)
    }

    /// Saves every parameter to `<path>-<global_step>.bpat` (default `<logdir>/model`).
    pub fn save(&mut self, path: Option<&Path>) -> Result<PathBuf> {
        self.open_session()?;
        let prefix = path.map_or_else(|| self.logdir.join("model"), Path::to_path_buf);
        let (Some(supervisor), Some(net)) = (self.supervisor.as_mut(), self.network.as_ref()) else {
            return Err(RnnError::NotCompiled);
        };
        supervisor.save(net, &prefix)
    }

    /// Loads the latest checkpoint of `dir` (default: the log directory).
    pub fn restore(&mut self, dir: Option<&Path>) -> Result<PathBuf> {
        if !self.is_compiled() {
            return Err(RnnError::NotCompiled);
        }
        if !self.is_finalized() {
            self.finalize();
        }
        let dir = dir.map_or_else(|| self.logdir.clone(), Path::to_path_buf);
        let (Some(supervisor), Some(net)) = (self.supervisor.as_mut(), self.network.as_mut()) else {
            return Err(RnnError::NotCompiled);
        };
        supervisor.restore(net, &dir)
    }
}
