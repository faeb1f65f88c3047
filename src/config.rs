//! JSON configuration of a complete network.
//!
//! ```json
//! {
//!   "name": "ptb_small",
//!   "initializer": { "type": "uniform", "low": -0.1, "high": 0.1 },
//!   "input": { "dtype": "int32", "vocab_size": 10000, "embedding_size": 200 },
//!   "output": { "shape": [10000], "dtype": "float32" },
//!   "target": { "dtype": "int32" },
//!   "loss": "sequence_loss",
//!   "cells": [
//!     { "type": "basic_lstm", "num_units": 200 },
//!     { "type": "basic_lstm", "num_units": 200 }
//!   ],
//!   "trainer": {
//!     "batch_size": 20, "num_steps": 20, "learning_rate": 1.0,
//!     "clipper": { "global_norm": 5.0 }, "lr_decay": 0.5, "decay_after": 4
//!   },
//!   "validator": { "batch_size": 20, "num_steps": 20 }
//! }
//! ```
//!
//! Without an `evaluator` section the default evaluator (batch 1, one step per window)
//! is attached.

use crate::cells::{CellSpec, Initializer};
use crate::error::Result;
use crate::loss::LossKind;
use crate::modelio::DEFAULT_SAVE_MODEL_SECS;
use crate::shapes::{InputDecl, OutputDecl, TargetDecl};
use crate::trainer::TrainerConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

fn default_save_model_secs() -> Option<u64> {
    Some(DEFAULT_SAVE_MODEL_SECS)
}

fn default_record_every() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_eval_batch() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub batch_size: usize,
    pub num_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_eval_batch")]
    pub batch_size: usize,
    #[serde(default = "default_record_every")]
    pub record_every: usize,
    #[serde(default = "default_true")]
    pub log_state: bool,
    #[serde(default = "default_true")]
    pub log_input: bool,
    #[serde(default = "default_true")]
    pub log_output: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_eval_batch(),
            record_every: default_record_every(),
            log_state: true,
            log_input: true,
            log_output: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RnnConfig {
    pub name: String,
    /// Defaults to a directory named after the network.
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    #[serde(default)]
    pub initializer: Initializer,
    #[serde(default)]
    pub seed: Option<u64>,
    /// `null` disables automatic saves.
    #[serde(default = "default_save_model_secs")]
    pub save_model_secs: Option<u64>,
    pub input: InputDecl,
    pub output: OutputDecl,
    pub target: TargetDecl,
    pub loss: LossKind,
    pub cells: Vec<CellSpec>,
    #[serde(default)]
    pub trainer: Option<TrainerConfig>,
    #[serde(default)]
    pub validator: Option<ValidatorConfig>,
    #[serde(default)]
    pub evaluator: Option<EvaluatorConfig>,
}

impl RnnConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::DType;

    #[test]
    fn fills_defaults() {
        let config = RnnConfig::from_json_str(
            r#"{
                "name": "tiny",
                "input": { "shape": [3], "dtype": "float32" },
                "output": { "shape": [2], "dtype": "float32" },
                "target": { "shape": [2], "dtype": "float32" },
                "loss": "mean_squared",
                "cells": [{ "type": "gru", "num_units": 4 }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.initializer, Initializer::default());
        assert_eq!(config.save_model_secs, Some(DEFAULT_SAVE_MODEL_SECS));
        assert_eq!(config.input.dtype, DType::Float32);
        assert_eq!(config.cells, vec![CellSpec::gru(4)]);
        assert!(config.trainer.is_none());
    }

    #[test]
    fn parses_full_lstm_options() {
        let spec: CellSpec = serde_json::from_str(
            r#"{ "type": "lstm", "num_units": 8, "use_peepholes": true, "cell_clip": 3.0, "num_proj": 4 }"#,
        )
        .unwrap();
        assert_eq!(spec.output_size(), 4);
    }
}
