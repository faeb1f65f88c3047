//! Checkpoints and the training supervisor.
//!
//! # `.bpat` Checkpoint Format
//!
//! A checkpoint stores the global step and every named parameter of a network:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ Header       │ Tensor (repeated `count` times)          │
//! ├──────────────┼──────────────────────────────────────────┤
//! │ "bpat"[4]    │ u16: name length, [u8] UTF-8 name        │
//! │ u8: version  │ u64: ndim, [u64; ndim] shape             │
//! │ u64: step    │ [f64; prod(shape)] data                  │
//! │ u32: count   │                                          │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! All integers and floats are little-endian. Every decoded tensor is checked through
//! [`briny`]'s `Validate`/`TrustedData` before it reaches a network.
//!
//! # Files
//!
//! Saving to `<dir>/model` at step 1200 writes `<dir>/model-1200.bpat` and records the
//! file name in `<dir>/checkpoint`, so the most recent save can be found again with
//! [`latest_checkpoint`].
//!
//! # Example
//!
//! ```rust
//! use briny_rnn::modelio::{Checkpoint, load_checkpoint, save_checkpoint};
//! use briny_rnn::tensors::Tensor;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = std::env::temp_dir().join("briny_rnn_doc");
//!     std::fs::create_dir_all(&dir)?;
//!     let path = dir.join("model-3.bpat");
//!
//!     let checkpoint = Checkpoint {
//!         global_step: 3,
//!         tensors: vec![("w".into(), Tensor::new(vec![2], vec![1.0, 2.0]))],
//!     };
//!     save_checkpoint(&path, &checkpoint)?;
//!     assert_eq!(load_checkpoint(&path)?, checkpoint);
//!     Ok(())
//! }
//! ```

use crate::error::{Result, RnnError};
use crate::network::Network;
use crate::tensors::{Ten64, Tensor};
use briny::prelude::*;
use log::{info, warn};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const BPAT_MAGIC: &[u8; 4] = b"bpat";
const BPAT_VERSION: u8 = 2;
const MAX_RANK: usize = 16;

/// Name of the index file kept next to checkpoints.
pub const CHECKPOINT_INDEX: &str = "checkpoint";

/// Default interval between automatic saves.
pub const DEFAULT_SAVE_MODEL_SECS: u64 = 600;

/// Named parameter values and the step they were taken at.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub global_step: u64,
    pub tensors: Vec<(String, Ten64)>,
}

/// Internal representation of a packed tensor.
struct PackedTensor {
    shape: Vec<u64>,
    data: Vec<f64>,
}

impl Validate for PackedTensor {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.shape.len() > MAX_RANK {
            return Err(ValidationError);
        }
        let expected = self
            .shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .ok_or(ValidationError)?;
        if self.data.len() as u64 != expected {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn corrupt(msg: impl Into<String>) -> RnnError {
    RnnError::Checkpoint(msg.into())
}

/// Writes a checkpoint to `path`.
///
/// # Errors
/// - I/O failures.
/// - More tensors than the format can count, or a name longer than `u16::MAX` bytes.
pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let count = u32::try_from(checkpoint.tensors.len())
        .map_err(|_| corrupt("too many tensors for one checkpoint"))?;

    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(BPAT_MAGIC)?;
    file.write_all(&[BPAT_VERSION])?;
    file.write_all(&checkpoint.global_step.to_le_bytes())?;
    file.write_all(&count.to_le_bytes())?;

    for (name, tensor) in &checkpoint.tensors {
        if tensor.data.len() != tensor.shape.iter().product::<usize>() {
            return Err(corrupt(format!("tensor `{name}` shape/data mismatch")));
        }
        let name_len = u16::try_from(name.len())
            .map_err(|_| corrupt(format!("tensor name `{name}` is too long")))?;
        file.write_all(&name_len.to_le_bytes())?;
        file.write_all(name.as_bytes())?;

        file.write_all(&(tensor.shape.len() as u64).to_le_bytes())?;
        for &dim in &tensor.shape {
            file.write_all(&(dim as u64).to_le_bytes())?;
        }
        for &val in &tensor.data {
            file.write_all(&val.to_le_bytes())?;
        }
    }

    file.flush()?;
    Ok(())
}

fn read_array<const N: usize>(file: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    file.read_exact(&mut buf)
        .map_err(|e| corrupt(format!("truncated checkpoint: {e}")))?;
    Ok(buf)
}

/// Reads a checkpoint written by [`save_checkpoint`].
///
/// # Errors
/// - I/O failures.
/// - Wrong magic or version, truncated data, non UTF-8 names, or tensors whose shape
///   does not describe their data.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let mut file = BufReader::new(File::open(path)?);

    // magic header
    if &read_array::<4>(&mut file)? != BPAT_MAGIC {
        return Err(corrupt("invalid magic header"));
    }
    let [version] = read_array::<1>(&mut file)?;
    if version != BPAT_VERSION {
        return Err(corrupt(format!(
            "unsupported checkpoint version {version}, expected {BPAT_VERSION}"
        )));
    }
    let global_step = u64::from_le_bytes(read_array(&mut file)?);
    let count = u32::from_le_bytes(read_array(&mut file)?) as usize;

    let mut tensors = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name_len = u16::from_le_bytes(read_array(&mut file)?) as usize;
        let mut name = vec![0u8; name_len];
        file.read_exact(&mut name)
            .map_err(|e| corrupt(format!("truncated tensor name: {e}")))?;
        let name = String::from_utf8(name).map_err(|_| corrupt("tensor name is not UTF-8"))?;

        let ndim = u64::from_le_bytes(read_array(&mut file)?) as usize;
        if ndim > MAX_RANK {
            return Err(corrupt(format!("tensor `{name}` has rank {ndim}")));
        }
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(u64::from_le_bytes(read_array(&mut file)?));
        }

        let size = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))
            .ok_or_else(|| corrupt(format!("tensor `{name}` shape overflows")))?;
        let mut data = Vec::with_capacity(size.min(1 << 20));
        for _ in 0..size {
            data.push(f64::from_le_bytes(read_array(&mut file)?));
        }

        let raw_tensor = PackedTensor { shape, data };
        let trusted = TrustedData::new(raw_tensor)
            .map_err(|_| corrupt(format!("tensor `{name}` failed validation")))?;
        let inner = trusted.into_inner();
        let shape_usize: Vec<usize> = inner.shape.iter().map(|&x| x as usize).collect();
        tensors.push((name, Tensor::new(shape_usize, inner.data)));
    }

    Ok(Checkpoint {
        global_step,
        tensors,
    })
}

/// Step encoded in a `<prefix>-<step>.bpat` file name.
fn step_of(path: &Path) -> Option<u64> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".bpat")?;
    let (_, step) = stem.rsplit_once('-')?;
    step.parse().ok()
}

/// Locates the most recent checkpoint in `dir`.
///
/// The index file wins when it names an existing checkpoint; otherwise the file with
/// the highest step is returned. A missing directory holds no checkpoint.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    if let Ok(index) = fs::read_to_string(dir.join(CHECKPOINT_INDEX)) {
        let named = index
            .lines()
            .find_map(|line| line.strip_prefix("model_checkpoint_path:"))
            .map(|rest| rest.trim().trim_matches('"'));
        if let Some(file) = named {
            let path = dir.join(file);
            if path.is_file() {
                return Ok(Some(path));
            }
            warn!("checkpoint index names missing file {}", path.display());
        }
    }

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(step) = step_of(&path) {
            if best.as_ref().is_none_or(|(s, _)| step > *s) {
                best = Some((step, path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn write_index(dir: &Path, file_name: &str) -> Result<()> {
    fs::write(
        dir.join(CHECKPOINT_INDEX),
        format!("model_checkpoint_path: \"{file_name}\"\n"),
    )?;
    Ok(())
}

/// Saves a network under `prefix` (`<prefix>-<global_step>.bpat`) and updates the index.
pub fn save_network(net: &Network, prefix: &Path) -> Result<PathBuf> {
    let stem = prefix
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| RnnError::InvalidConfig(format!("bad save path {}", prefix.display())))?;
    let dir = prefix.parent().unwrap_or_else(|| Path::new(""));
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)?;
    }

    let file_name = format!("{stem}-{}.bpat", net.global_step);
    let path = dir.join(&file_name);
    save_checkpoint(&path, &net.to_checkpoint())?;
    write_index(dir, &file_name)?;
    Ok(path)
}

/// Restores a network from the latest checkpoint in `dir`.
///
/// # Errors
/// [`RnnError::NoCheckpoint`] when `dir` holds none.
pub fn restore_network(net: &mut Network, dir: &Path) -> Result<PathBuf> {
    let path = latest_checkpoint(dir)?.ok_or_else(|| RnnError::NoCheckpoint(dir.to_path_buf()))?;
    net.load_checkpoint(load_checkpoint(&path)?)?;
    Ok(path)
}

/// Owns the log directory of a finalized network: restores the latest checkpoint when
/// the first session opens and saves periodically afterwards.
#[derive(Debug, Clone)]
pub struct Supervisor {
    logdir: PathBuf,
    save_model_secs: Option<u64>,
    last_save: Instant,
    session_started: bool,
}

impl Supervisor {
    /// `save_model_secs: None` disables automatic saves.
    pub fn new(logdir: impl Into<PathBuf>, save_model_secs: Option<u64>) -> Self {
        Self {
            logdir: logdir.into(),
            save_model_secs,
            last_save: Instant::now(),
            session_started: false,
        }
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    pub fn session_started(&self) -> bool {
        self.session_started
    }

    /// Opens the session. The first call restores the latest checkpoint of the log
    /// directory, if any; later calls do nothing.
    pub fn managed_session(&mut self, net: &mut Network) -> Result<Option<PathBuf>> {
        if self.session_started {
            return Ok(None);
        }
        self.session_started = true;
        self.last_save = Instant::now();
        match latest_checkpoint(&self.logdir)? {
            Some(path) => {
                net.load_checkpoint(load_checkpoint(&path)?)?;
                info!(
                    "restored {} at step {} from {}",
                    net.name(),
                    net.global_step,
                    path.display()
                );
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    pub fn save(&mut self, net: &Network, prefix: &Path) -> Result<PathBuf> {
        let path = save_network(net, prefix)?;
        self.last_save = Instant::now();
        info!("saved {} at step {} to {}", net.name(), net.global_step, path.display());
        Ok(path)
    }

    /// Restores from `dir`; the session counts as opened afterwards.
    pub fn restore(&mut self, net: &mut Network, dir: &Path) -> Result<PathBuf> {
        let path = restore_network(net, dir)?;
        self.session_started = true;
        info!("restored {} at step {} from {}", net.name(), net.global_step, path.display());
        Ok(path)
    }

    /// Saves to `<logdir>/model` once the save interval has elapsed.
    pub fn maybe_autosave(&mut self, net: &Network) -> Result<Option<PathBuf>> {
        let Some(secs) = self.save_model_secs else {
            return Ok(None);
        };
        if self.last_save.elapsed() < Duration::from_secs(secs) {
            return Ok(None);
        }
        let prefix = self.logdir.join("model");
        self.save(net, &prefix).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_from_file_name() {
        assert_eq!(step_of(Path::new("/tmp/model-120.bpat")), Some(120));
        assert_eq!(step_of(Path::new("my-model-7.bpat")), Some(7));
        assert_eq!(step_of(Path::new("model.bpat")), None);
        assert_eq!(step_of(Path::new("checkpoint")), None);
    }

    #[test]
    fn rejects_inconsistent_packed_tensor() {
        let bad = PackedTensor {
            shape: vec![2, 2],
            data: vec![1.0; 3],
        };
        assert!(bad.validate().is_err());
        let good = PackedTensor {
            shape: vec![3],
            data: vec![1.0; 3],
        };
        assert!(good.validate().is_ok());
    }
}
