//! Checkpoint-argument inheritance.
//!
//! Training writes the resolved [`RunConfig`] to `sft_args.json` in its output
//! directory. Inference and adapter merging read that snapshot back so the
//! model identity, precision, quantization and dataset split match the run
//! that produced the checkpoint.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::args::RunConfig;
use crate::error::{ResolveError, ResolveResult};

pub const SNAPSHOT_FILE_NAME: &str = "sft_args.json";

/// Keys always taken from the snapshot when present.
const MODEL_KEYS: &[&str] = &[
    "model_type",
    "model_id_or_path",
    "model_revision",
    "model_cache_dir",
    "sft_type",
    "template_type",
    "dtype",
    "system",
    "quantization_bit",
    "bnb_4bit_comp_dtype",
    "bnb_4bit_quant_type",
    "bnb_4bit_use_double_quant",
];

/// Keys taken from the snapshot unless evaluating interactively.
const DATASET_KEYS: &[&str] = &[
    "dataset",
    "dataset_seed",
    "dataset_test_ratio",
    "check_dataset_strategy",
    "custom_train_dataset_path",
    "custom_val_dataset_path",
];

/// Keys where a user-supplied value beats the snapshot.
const KEEP_IF_SET: &[&str] = &[
    "model_cache_dir",
    "dataset",
    "custom_train_dataset_path",
    "custom_val_dataset_path",
];

/// Overwrite allow-listed fields of `cfg` from `<ckpt_dir>/sft_args.json`.
///
/// Returns the new config and whether a snapshot was applied. Without a
/// `ckpt_dir`, `load_args_from_ckpt_dir` is switched off. A missing snapshot
/// leaves the config unchanged.
pub fn inherit_from_checkpoint(mut cfg: RunConfig) -> ResolveResult<(RunConfig, bool)> {
    let Some(ckpt_dir) = cfg.ckpt_dir.clone() else {
        if cfg.load_args_from_ckpt_dir {
            info!("ckpt_dir is not set, setting load_args_from_ckpt_dir: false");
            cfg.load_args_from_ckpt_dir = false;
        }
        return Ok((cfg, false));
    };
    if !cfg.load_args_from_ckpt_dir {
        return Ok((cfg, false));
    }

    let path = ckpt_dir.join(SNAPSHOT_FILE_NAME);
    if !path.is_file() {
        info!(path = %path.display(), "No argument snapshot in checkpoint, keeping arguments as given");
        return Ok((cfg, false));
    }

    let snapshot: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    let Value::Object(snapshot) = snapshot else {
        return Err(ResolveError::validation(
            "ckpt_dir",
            format!("'{}' does not hold a JSON object", path.display()),
        ));
    };

    let cfg = apply_snapshot(cfg, &snapshot)?;
    info!(path = %path.display(), "Loaded arguments from checkpoint snapshot");
    Ok((cfg, true))
}

fn apply_snapshot(cfg: RunConfig, snapshot: &Map<String, Value>) -> ResolveResult<RunConfig> {
    let hub_token = cfg.hub_token.clone();
    let eval_human = cfg.eval_human;

    let Value::Object(mut current) = serde_json::to_value(&cfg)? else {
        return Err(ResolveError::validation("ckpt_dir", "run arguments did not serialize to an object"));
    };

    let dataset_keys: &[&str] = if eval_human { &[] } else { DATASET_KEYS };
    for &key in MODEL_KEYS.iter().chain(dataset_keys) {
        let Some(value) = snapshot.get(key) else {
            continue;
        };
        let user_set = current.get(key).is_some_and(|v| !v.is_null());
        if KEEP_IF_SET.contains(&key) && user_set {
            debug!(key, "Keeping user-supplied value over snapshot");
            continue;
        }
        current.insert(key.to_string(), value.clone());
    }

    let mut merged: RunConfig = serde_json::from_value(Value::Object(current))?;
    merged.hub_token = hub_token;
    Ok(merged)
}

/// Persist `cfg` as `<dir>/sft_args.json`, creating `dir` if needed.
pub fn write_snapshot(cfg: &RunConfig, dir: &Path) -> ResolveResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(SNAPSHOT_FILE_NAME);
    std::fs::write(&path, serde_json::to_string_pretty(cfg)?)?;
    info!(path = %path.display(), "Saved run arguments");
    Ok(path)
}
