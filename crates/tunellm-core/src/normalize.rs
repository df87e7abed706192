//! Legacy-alias rewriting and path normalization.
//!
//! Both passes are pure rewrites of a [`RunConfig`] and are idempotent: running
//! them on an already normalized configuration returns it unchanged.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::args::{RunConfig, RunMode, DEFAULT_TARGET_MODULES};
use crate::error::{ResolveError, ResolveResult};

/// Deprecated `template_type` spellings and their current names.
const TEMPLATE_ALIASES: &[(&str, &str)] = &[
    ("chatglm2-generation", "chatglm-generation"),
    ("qwen", "chatml"),
];

/// Default for `val_dataset_sample` / `show_dataset_sample` in inference modes.
const DEFAULT_VAL_SAMPLE: i64 = 10;

/// Rewrite deprecated values to their canonical form.
///
/// - a single comma-joined `dataset` entry is split into a list;
/// - `template_type` aliases are mapped through [`TEMPLATE_ALIASES`];
/// - `lora_target_modules == ["AUTO"]` becomes `["DEFAULT"]`;
/// - inference modes: a non-default `show_dataset_sample` is carried over into
///   a defaulted `val_dataset_sample`.
pub fn apply_compatibility(mut cfg: RunConfig, mode: RunMode) -> RunConfig {
    if let Some(dataset) = &cfg.dataset {
        if dataset.len() == 1 && dataset[0].contains(',') {
            cfg.dataset = Some(
                dataset[0]
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
    }

    if let Some((_, canonical)) = TEMPLATE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == cfg.template_type)
    {
        debug!(from = %cfg.template_type, to = canonical, "Rewriting template_type alias");
        cfg.template_type = canonical.to_string();
    }

    if let Some(modules) = &cfg.lora_target_modules {
        if modules.len() == 1 && modules[0] == "AUTO" {
            cfg.lora_target_modules = Some(vec![DEFAULT_TARGET_MODULES.to_string()]);
        }
    }

    if mode.is_inference() {
        let val = *cfg.val_dataset_sample.get_or_insert(DEFAULT_VAL_SAMPLE);
        if cfg.show_dataset_sample != DEFAULT_VAL_SAMPLE && val == DEFAULT_VAL_SAMPLE {
            cfg.val_dataset_sample = Some(cfg.show_dataset_sample);
        }
    }

    cfg
}

/// Expand `~`, make every path-like field absolute and check that input paths
/// exist.
///
/// `output_dir` and `logging_dir` are only normalized; every other path-like
/// field must exist on disk. `model_id_or_path` is treated as a path only when
/// it starts with `~` or `/`.
pub fn normalize_paths(mut cfg: RunConfig) -> ResolveResult<RunConfig> {
    cfg.model_cache_dir = checked_opt("model_cache_dir", cfg.model_cache_dir)?;
    cfg.ckpt_dir = checked_opt("ckpt_dir", cfg.ckpt_dir)?;
    cfg.resume_from_checkpoint = checked_opt("resume_from_checkpoint", cfg.resume_from_checkpoint)?;
    cfg.deepspeed_config_path = checked_opt("deepspeed_config_path", cfg.deepspeed_config_path)?;
    cfg.custom_train_dataset_path =
        checked_list("custom_train_dataset_path", cfg.custom_train_dataset_path)?;
    cfg.custom_val_dataset_path =
        checked_list("custom_val_dataset_path", cfg.custom_val_dataset_path)?;

    if let Some(id) = &cfg.model_id_or_path {
        if id.starts_with('~') || id.starts_with('/') {
            let path = checked("model_id_or_path", Path::new(id))?;
            cfg.model_id_or_path = Some(path.to_string_lossy().into_owned());
        }
    }

    cfg.output_dir = absolute(&cfg.output_dir)?;
    cfg.logging_dir = cfg.logging_dir.as_deref().map(absolute).transpose()?;
    Ok(cfg)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// `~` expansion followed by lexical absolutization (`.` and `..` collapsed,
/// symlinks left alone).
pub fn absolute(path: &Path) -> ResolveResult<PathBuf> {
    let expanded = expand_home(path);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(expanded)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

fn checked(field: &str, path: &Path) -> ResolveResult<PathBuf> {
    let path = absolute(path)?;
    if !path.exists() {
        return Err(ResolveError::PathNotFound {
            field: field.to_string(),
            path,
        });
    }
    Ok(path)
}

fn checked_opt(field: &str, path: Option<PathBuf>) -> ResolveResult<Option<PathBuf>> {
    path.map(|p| checked(field, &p)).transpose()
}

fn checked_list(field: &str, paths: Option<Vec<PathBuf>>) -> ResolveResult<Option<Vec<PathBuf>>> {
    paths
        .map(|list| list.iter().map(|p| checked(field, p)).collect())
        .transpose()
}
