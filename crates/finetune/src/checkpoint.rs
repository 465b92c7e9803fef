//! Base checkpoint validation/loading and adapter-only checkpoint files.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use model::{is_lora_parameter, Config, Gpt, LoraConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{to_runtime_error, Result, TrainingError},
    fabric::Fabric,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BASE_WEIGHTS_FILENAME: &str = "model.safetensors";
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
pub const MODEL_CONFIG_FILENAME: &str = "model_config.json";
pub const FINAL_CHECKPOINT_FILENAME: &str = "model_lora_finetuned.safetensors";
/// Every tensor in an adapter checkpoint lives under this key prefix.
pub const STATE_PREFIX: &str = "model.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// JSON written next to every adapter checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraCheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub iteration: usize,
    pub step_count: usize,
    pub lora: LoraConfig,
    pub tensors: Vec<String>,
    pub weights: FileRecord,
}

/// Where in training a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveInfo {
    pub iteration: usize,
    pub step_count: usize,
}

/// Confirms `dir` holds a usable base checkpoint and returns its architecture.
///
/// The architecture comes from `model_config.json` when present, otherwise
/// from the directory name.
pub fn check_valid_checkpoint_dir(dir: &Path) -> Result<Config> {
    if !dir.is_dir() {
        return Err(TrainingError::invalid_checkpoint_dir(
            dir,
            "directory does not exist",
        ));
    }
    let missing: Vec<&str> = [BASE_WEIGHTS_FILENAME, TOKENIZER_FILENAME]
        .into_iter()
        .filter(|name| !dir.join(name).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(TrainingError::invalid_checkpoint_dir(
            dir,
            format!("missing {}", missing.join(", ")),
        ));
    }

    let config_path = dir.join(MODEL_CONFIG_FILENAME);
    if config_path.is_file() {
        return Config::from_json(&config_path)
            .map_err(|err| TrainingError::invalid_checkpoint_dir(dir, err.to_string()));
    }
    let name = dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TrainingError::invalid_checkpoint_dir(dir, "directory name is not UTF-8"))?;
    Config::from_name(name).map_err(|err| {
        TrainingError::invalid_checkpoint_dir(
            dir,
            format!("no {MODEL_CONFIG_FILENAME} and {err}"),
        )
    })
}

/// Loads base weights into `model`; unknown tensors are ignored.
pub fn load_base_checkpoint(model: &mut Gpt, path: &Path) -> Result<Vec<String>> {
    let tensors = candle_core::safetensors::load(path, model.device()).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to read base checkpoint {}: {err}",
            path.display()
        ))
    })?;
    model.load_base_weights(tensors).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to load base checkpoint {}: {err}",
            path.display()
        ))
    })
}

pub fn periodic_checkpoint_path(out_dir: &Path, iteration: usize) -> PathBuf {
    out_dir.join(format!("iter-{iteration:06}-ckpt.safetensors"))
}

pub fn final_checkpoint_path(out_dir: &Path) -> PathBuf {
    out_dir.join(FINAL_CHECKPOINT_FILENAME)
}

pub fn manifest_path(weights_path: &Path) -> PathBuf {
    weights_path.with_extension("json")
}

/// Writes the adapter tensors of `model` to `path` on global rank zero.
///
/// A model without adapters still produces a file and manifest, with no
/// tensors in them.
///
/// Other ranks write nothing and return `None`; every rank meets at a barrier
/// before returning.
pub fn save_lora_checkpoint(
    fabric: &dyn Fabric,
    model: &Gpt,
    path: &Path,
    info: SaveInfo,
) -> Result<Option<LoraCheckpointManifest>> {
    fabric.print(&format!("Saving LoRA weights to {:?}", path.display().to_string()));
    let manifest = if fabric.is_global_zero() {
        Some(write_lora_checkpoint(model, path, info)?)
    } else {
        None
    };
    fabric.barrier()?;
    Ok(manifest)
}

fn write_lora_checkpoint(model: &Gpt, path: &Path, info: SaveInfo) -> Result<LoraCheckpointManifest> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tensors: HashMap<String, Tensor> = model
        .state_dict()
        .map_err(to_runtime_error)?
        .into_iter()
        .filter(|(name, _)| is_lora_parameter(name))
        .map(|(name, tensor)| (format!("{STATE_PREFIX}{name}"), tensor))
        .collect();
    if tensors.is_empty() {
        log::warn!("model has no adapter parameters, writing an empty checkpoint to {}", path.display());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to write adapter checkpoint {}: {err}",
            path.display()
        ))
    })?;

    let mut names: Vec<String> = tensors.into_keys().collect();
    names.sort();
    let manifest = LoraCheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        iteration: info.iteration,
        step_count: info.step_count,
        lora: model.lora_config().clone(),
        tensors: names,
        weights: file_record(path)?,
    };
    fs::write(manifest_path(path), serde_json::to_vec_pretty(&manifest)?)?;
    Ok(manifest)
}

/// Reads an adapter checkpoint, verifying its checksum when a manifest
/// exists, and strips the key prefix.
pub fn read_lora_checkpoint(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let manifest_file = manifest_path(path);
    if manifest_file.is_file() {
        let manifest: LoraCheckpointManifest =
            serde_json::from_slice(&fs::read(&manifest_file)?)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(TrainingError::runtime(format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                manifest.version
            )));
        }
        if sha256_file(path)? != manifest.weights.sha256 {
            return Err(TrainingError::runtime(format!(
                "checkpoint file {} failed checksum validation",
                path.display()
            )));
        }
    }
    let tensors = candle_core::safetensors::load(path, device).map_err(to_runtime_error)?;
    tensors
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix(STATE_PREFIX) {
            Some(stripped) => Ok((stripped.to_string(), tensor)),
            None => Err(TrainingError::runtime(format!(
                "tensor '{name}' is outside the '{STATE_PREFIX}' namespace"
            ))),
        })
        .collect()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_names_are_zero_padded() {
        let out = Path::new("out/lora/alpaca");
        assert_eq!(
            periodic_checkpoint_path(out, 100),
            Path::new("out/lora/alpaca/iter-000100-ckpt.safetensors")
        );
        assert_eq!(
            manifest_path(&final_checkpoint_path(out)),
            Path::new("out/lora/alpaca/model_lora_finetuned.json")
        );
    }

    #[test]
    fn rejects_incomplete_checkpoint_dirs() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let missing = root.path().join("pythia-14m");
        assert!(matches!(
            check_valid_checkpoint_dir(&missing),
            Err(TrainingError::InvalidCheckpointDir { .. })
        ));

        fs::create_dir(&missing)?;
        fs::write(missing.join(BASE_WEIGHTS_FILENAME), b"")?;
        let err = check_valid_checkpoint_dir(&missing).err().map(|e| e.to_string());
        assert!(err.is_some_and(|msg| msg.contains("tokenizer.json")));

        fs::write(missing.join(TOKENIZER_FILENAME), b"{}")?;
        let config = check_valid_checkpoint_dir(&missing)?;
        assert_eq!(config.name, "pythia-14m");
        Ok(())
    }

    #[test]
    fn unknown_name_without_config_is_rejected() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("mystery-model");
        fs::create_dir(&dir)?;
        fs::write(dir.join(BASE_WEIGHTS_FILENAME), b"")?;
        fs::write(dir.join(TOKENIZER_FILENAME), b"{}")?;
        assert!(check_valid_checkpoint_dir(&dir).is_err());
        Ok(())
    }
}
