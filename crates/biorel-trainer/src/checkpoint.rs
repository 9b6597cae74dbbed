//! Checkpoint directories.
//!
//! ```text
//! <dir>/model.safetensors   trained parameters
//! <dir>/ema.safetensors     moving averages
//! <dir>/manifest.json       epoch, representation and sub-task layout
//! ```
//!
//! Restoring checks the manifest layout, the tensor names and every shape
//! against the live model before anything is overwritten.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use biorel_core::{RepresentationMode, Task};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::ema::Ema;
use crate::error::TrainerError;
use crate::model::{JointModel, NamedVar};

pub const MODEL_FILE: &str = "model.safetensors";
pub const EMA_FILE: &str = "ema.safetensors";
pub const MANIFEST_FILE: &str = "manifest.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub epoch: usize,
    pub representation: RepresentationMode,
    pub sub_tasks: BTreeMap<Task, Vec<String>>,
}

/// Writes the model and its averages to `dir`, creating it if needed.
pub fn save<P: AsRef<Path>>(
    dir: P,
    epoch: usize,
    representation: RepresentationMode,
    model: &JointModel,
    ema: &Ema,
) -> Result<(), TrainerError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let params: HashMap<String, Tensor> = model
        .parameters()?
        .into_iter()
        .map(|p| (p.name, p.var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&params, dir.join(MODEL_FILE))?;

    let shadow: HashMap<String, Tensor> = ema
        .shadow()
        .iter()
        .map(|(name, t)| (name.clone(), t.clone()))
        .collect();
    candle_core::safetensors::save(&shadow, dir.join(EMA_FILE))?;

    let manifest = Manifest {
        version: FORMAT_VERSION,
        epoch,
        representation,
        sub_tasks: model.sub_tasks(),
    };
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| TrainerError::CheckpointMismatch(format!("manifest: {e}")))?;
    std::fs::write(dir.join(MANIFEST_FILE), json)?;

    tracing::info!(epoch, "saved checkpoint to {}", dir.display());
    Ok(())
}

/// Restores a checkpoint into `model` and `ema`. Returns its manifest.
pub fn load<P: AsRef<Path>>(
    dir: P,
    representation: RepresentationMode,
    model: &JointModel,
    ema: &mut Ema,
) -> Result<Manifest, TrainerError> {
    let dir = dir.as_ref();
    let text = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = serde_json::from_str(&text)
        .map_err(|e| TrainerError::CheckpointMismatch(format!("manifest: {e}")))?;

    if manifest.version != FORMAT_VERSION {
        return Err(TrainerError::CheckpointMismatch(format!(
            "format version {} is not supported",
            manifest.version
        )));
    }
    if manifest.representation != representation {
        return Err(TrainerError::CheckpointMismatch(format!(
            "checkpoint uses {} representation, model uses {representation}",
            manifest.representation
        )));
    }
    if manifest.sub_tasks != model.sub_tasks() {
        return Err(TrainerError::CheckpointMismatch(
            "sub-task layout differs from the model".into(),
        ));
    }

    let device = model.device();
    let params = model.parameters()?;
    let weights = candle_core::safetensors::load(dir.join(MODEL_FILE), device)?;
    check_tensors(&params, &weights, MODEL_FILE)?;
    let averages = candle_core::safetensors::load(dir.join(EMA_FILE), device)?;
    check_tensors(&params, &averages, EMA_FILE)?;

    for param in &params {
        if let Some(value) = weights.get(&param.name) {
            param.var.set(value)?;
        }
    }
    ema.load_shadow(averages.into_iter().collect());

    tracing::info!(epoch = manifest.epoch, "restored checkpoint from {}", dir.display());
    Ok(manifest)
}

fn check_tensors(
    params: &[NamedVar],
    tensors: &HashMap<String, Tensor>,
    file: &str,
) -> Result<(), TrainerError> {
    if tensors.len() != params.len() {
        return Err(TrainerError::CheckpointMismatch(format!(
            "{file} holds {} tensors, model has {} parameters",
            tensors.len(),
            params.len()
        )));
    }
    for param in params {
        let tensor = tensors.get(&param.name).ok_or_else(|| {
            TrainerError::CheckpointMismatch(format!("{file} has no tensor {}", param.name))
        })?;
        if tensor.dims() != param.var.dims() {
            return Err(TrainerError::CheckpointMismatch(format!(
                "{}: shape {:?} in {file}, {:?} in the model",
                param.name,
                tensor.dims(),
                param.var.dims()
            )));
        }
    }
    Ok(())
}
