//! Model snapshots: a shape signature plus named parameter payloads.
//!
//! Only the logical structure is specified here; the byte format is plain
//! JSON via serde. Loading validates the full snapshot against the target
//! model before touching any parameter, so a failed load never leaves a
//! model partially overwritten.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nn::{Mlp, NnError};

/// Errors for checkpoint persistence and loading
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("architecture mismatch: model is {expected}, checkpoint is {found}")]
    ArchMismatch { expected: ArchSpec, found: ArchSpec },
    #[error("checkpoint is missing parameter `{name}`")]
    MissingParameter { name: String },
    #[error("parameter `{name}` holds {got} values, expected {expected}")]
    PayloadSizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("checkpoint declares an invalid architecture: {0}")]
    InvalidArch(#[from] NnError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A model's shape signature: everything needed to rebuild its layer stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchSpec {
    pub input: usize,
    pub hidden: Vec<usize>,
    pub output: usize,
    pub dropout: f32,
}

impl fmt::Display for ArchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:?}-{} (dropout {})",
            self.input, self.hidden, self.output, self.dropout
        )
    }
}

impl ArchSpec {
    /// Layer widths in forward order, including the output head.
    fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.hidden.len() + 1);
        let mut width = self.input;
        for &units in &self.hidden {
            dims.push((width, units));
            width = units;
        }
        dims.push((width, self.output));
        dims
    }
}

/// A serializable snapshot of a model: shape signature plus a mapping from
/// parameter name to flattened payload. Weight payloads are row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub arch: ArchSpec,
    pub params: BTreeMap<String, Vec<f32>>,
}

impl Checkpoint {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn weight_name(idx: usize) -> String {
    format!("layers.{idx}.weight")
}

fn bias_name(idx: usize) -> String {
    format!("layers.{idx}.bias")
}

fn fetch<'a>(
    params: &'a BTreeMap<String, Vec<f32>>,
    name: String,
    expected: usize,
) -> Result<&'a [f32], CheckpointError> {
    let payload = params
        .get(&name)
        .ok_or_else(|| CheckpointError::MissingParameter { name: name.clone() })?;
    if payload.len() != expected {
        return Err(CheckpointError::PayloadSizeMismatch {
            name,
            expected,
            got: payload.len(),
        });
    }
    Ok(payload)
}

impl Mlp {
    /// Exports the model's shape signature and parameter payloads.
    pub fn checkpoint(&self) -> Checkpoint {
        let mut params = BTreeMap::new();
        for (idx, layer) in self.layers().enumerate() {
            params.insert(weight_name(idx), layer.weight_data());
            params.insert(bias_name(idx), layer.bias_data());
        }
        Checkpoint {
            arch: self.arch().clone(),
            params,
        }
    }

    /// Rebuilds a model from a snapshot.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Mlp, CheckpointError> {
        let arch = &checkpoint.arch;
        let mut model = Mlp::new(arch.input, &arch.hidden, arch.output, arch.dropout)?;
        model.load_checkpoint(checkpoint)?;
        Ok(model)
    }

    /// Loads a snapshot into this model in place. The snapshot's shape
    /// signature must match exactly; mismatches fail with both signatures in
    /// the error, and the whole snapshot is validated before any parameter
    /// is written.
    pub fn load_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if *self.arch() != checkpoint.arch {
            return Err(CheckpointError::ArchMismatch {
                expected: self.arch().clone(),
                found: checkpoint.arch.clone(),
            });
        }
        let dims = self.arch().layer_dims();
        let mut payloads = Vec::with_capacity(dims.len());
        for (idx, &(in_features, out_features)) in dims.iter().enumerate() {
            let weight = fetch(
                &checkpoint.params,
                weight_name(idx),
                in_features * out_features,
            )?;
            let bias = fetch(&checkpoint.params, bias_name(idx), out_features)?;
            payloads.push((weight, bias));
        }
        for (layer, (weight, bias)) in self.layers_mut().zip(payloads) {
            layer.load_values(weight, bias);
        }
        Ok(())
    }
}
