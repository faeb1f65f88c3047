//! Validation and evaluation runs.
//!
//! An [`Evaluator`] owns an unrolled model and runs it over a data set without
//! updating any parameter. A validator is simply an evaluator that records nothing.
//! When recording, every `record_every`-th window is captured as a [`Record`] and the
//! records are written to `records.json` in the run's log directory.

use crate::data::Feeder;
use crate::error::Result;
use crate::loss::Loss;
use crate::model::{RnnModel, RunOps, WindowResult};
use crate::network::Network;
use crate::tensors::Ten64;
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// File the records of an evaluation are written to.
pub const RECORDS_FILE: &str = "records.json";

/// Values captured for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub window: usize,
    pub loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<f64>>,
    /// Final state of the window, one flattened vector per layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Vec<Vec<f64>>>,
}

/// Collects [`Record`]s while a model runs.
#[derive(Debug, Clone)]
pub struct Recorder {
    record_every: usize,
    log_state: bool,
    log_input: bool,
    log_output: bool,
    records: Vec<Record>,
}

impl Recorder {
    pub fn new(record_every: usize, log_state: bool, log_input: bool, log_output: bool) -> Self {
        Self {
            record_every: record_every.max(1),
            log_state,
            log_input,
            log_output,
            records: Vec::new(),
        }
    }

    pub fn observe(&mut self, window: usize, inputs: &Ten64, result: &WindowResult) {
        if window % self.record_every != 0 {
            return;
        }
        self.records.push(Record {
            window,
            loss: result.loss,
            inputs: self.log_input.then(|| inputs.data.clone()),
            outputs: self.log_output.then(|| result.outputs.data.clone()),
            state: self.log_state.then(|| {
                result
                    .final_state
                    .iter()
                    .map(|s| s.tensors().into_iter().flat_map(|t| t.data.iter().copied()).collect())
                    .collect()
            }),
        });
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Outcome of [`Evaluator::evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub perplexity: f64,
    pub time: Duration,
    pub records: Vec<Record>,
}

/// Per-call behaviour of [`Evaluator::evaluate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalOptions<'a> {
    /// Capture records according to the evaluator's logging flags.
    pub record: bool,
    pub verbose: bool,
    /// Directory receiving `records.json` when recording.
    pub logdir: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    model: RnnModel,
    record_every: usize,
    log_state: bool,
    log_input: bool,
    log_output: bool,
}

impl Evaluator {
    pub fn new(
        model: RnnModel,
        record_every: usize,
        log_state: bool,
        log_input: bool,
        log_output: bool,
    ) -> Self {
        Self {
            model,
            record_every: record_every.max(1),
            log_state,
            log_input,
            log_output,
        }
    }

    /// An evaluator that never records, used for validation.
    pub fn validator(model: RnnModel) -> Self {
        Self::new(model, 1, false, false, false)
    }

    pub fn model(&self) -> &RnnModel {
        &self.model
    }

    pub fn record_every(&self) -> usize {
        self.record_every
    }

    /// Runs `epoch_size` windows from a zero state.
    pub fn evaluate(
        &mut self,
        net: &mut Network,
        loss: &dyn Loss,
        feeder: &mut dyn Feeder,
        epoch_size: usize,
        options: EvalOptions<'_>,
    ) -> Result<Evaluation> {
        self.model.reset_state();
        let mut recorder = options.record.then(|| {
            Recorder::new(self.record_every, self.log_state, self.log_input, self.log_output)
        });
        let ops = RunOps {
            optimizer: None,
            recorder: recorder.as_mut(),
        };
        let verbose_every = options.verbose.then(|| (epoch_size / 10).max(1));
        let stats = self.model.run(net, loss, feeder, epoch_size, ops, verbose_every)?;

        let records = recorder.map(Recorder::into_records).unwrap_or_default();
        if let (true, Some(dir)) = (options.record, options.logdir) {
            write_records(dir, &records)?;
            info!(
                "{}: wrote {} records to {}",
                self.model.name(),
                records.len(),
                dir.join(RECORDS_FILE).display()
            );
        }

        Ok(Evaluation {
            loss: stats.loss,
            perplexity: stats.perplexity(),
            time: stats.time,
            records,
        })
    }
}

fn write_records(dir: &Path, records: &[Record]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut writer = BufWriter::new(File::create(dir.join(RECORDS_FILE))?);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;
    Ok(())
}
