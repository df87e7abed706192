//! Command-line overrides for every [`RunConfig`] field.
//!
//! Flags are all optional. Supplied ones are overlaid on the layered
//! configuration by field name, so enum-valued flags are validated by the
//! same serde rules as config files.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tunellm_core::RunConfig;

#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct RunFlags {
    // ── Model identity ────────────────────────────────────────────────────
    /// Registered model type, e.g. `qwen-7b-chat`.
    #[arg(long)]
    pub model_type: Option<String>,
    /// Hub id or local path of a registered model.
    #[arg(long)]
    pub model_id_or_path: Option<String>,
    #[arg(long)]
    pub model_revision: Option<String>,
    /// Local directory holding the model weights.
    #[arg(long)]
    pub model_cache_dir: Option<PathBuf>,

    /// lora | longlora | qalora | full
    #[arg(long)]
    pub sft_type: Option<String>,
    #[arg(long)]
    pub template_type: Option<String>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub add_output_dir_suffix: Option<bool>,
    /// nccl | gloo | mpi | ccl
    #[arg(long)]
    pub ddp_backend: Option<String>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub resume_from_checkpoint: Option<PathBuf>,
    /// auto | bf16 | fp16 | fp32
    #[arg(long)]
    pub dtype: Option<String>,

    // ── Dataset ───────────────────────────────────────────────────────────
    #[arg(long, num_args = 1..)]
    pub dataset: Option<Vec<String>>,
    #[arg(long)]
    pub dataset_seed: Option<u64>,
    #[arg(long)]
    pub dataset_test_ratio: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    pub train_dataset_sample: Option<i64>,
    #[arg(long, allow_hyphen_values = true)]
    pub val_dataset_sample: Option<i64>,
    #[arg(long)]
    pub system: Option<String>,
    /// -1 disables the limit.
    #[arg(long, allow_hyphen_values = true)]
    pub max_length: Option<i64>,
    /// ignore | truncation_left
    #[arg(long)]
    pub truncation_strategy: Option<String>,
    /// none | discard | error | warning
    #[arg(long)]
    pub check_dataset_strategy: Option<String>,
    #[arg(long, num_args = 1..)]
    pub custom_train_dataset_path: Option<Vec<PathBuf>>,
    #[arg(long, num_args = 1..)]
    pub custom_val_dataset_path: Option<Vec<PathBuf>>,

    // ── Quantization ──────────────────────────────────────────────────────
    /// 0, 4 or 8.
    #[arg(long)]
    pub quantization_bit: Option<i64>,
    #[arg(long)]
    pub bnb_4bit_comp_dtype: Option<String>,
    /// fp4 | nf4
    #[arg(long)]
    pub bnb_4bit_quant_type: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub bnb_4bit_use_double_quant: Option<bool>,

    // ── Adapter ───────────────────────────────────────────────────────────
    #[arg(long, num_args = 1..)]
    pub lora_target_modules: Option<Vec<String>>,
    #[arg(long)]
    pub lora_rank: Option<u32>,
    #[arg(long)]
    pub lora_alpha: Option<u32>,
    #[arg(long)]
    pub lora_dropout_p: Option<f64>,

    // ── Training loop ─────────────────────────────────────────────────────
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub gradient_checkpointing: Option<bool>,
    #[arg(long)]
    pub deepspeed_config_path: Option<PathBuf>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub eval_batch_size: Option<usize>,
    #[arg(long)]
    pub num_train_epochs: Option<u32>,
    #[arg(long, allow_hyphen_values = true)]
    pub max_steps: Option<i64>,
    #[arg(long)]
    pub optim: Option<String>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub weight_decay: Option<f64>,
    #[arg(long)]
    pub gradient_accumulation_steps: Option<usize>,
    #[arg(long)]
    pub max_grad_norm: Option<f64>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub predict_with_generate: Option<bool>,
    #[arg(long)]
    pub lr_scheduler_type: Option<String>,
    #[arg(long)]
    pub warmup_ratio: Option<f64>,
    #[arg(long)]
    pub eval_steps: Option<usize>,
    #[arg(long)]
    pub save_steps: Option<usize>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub only_save_model: Option<bool>,
    /// -1 keeps every checkpoint.
    #[arg(long, allow_hyphen_values = true)]
    pub save_total_limit: Option<i64>,
    #[arg(long)]
    pub logging_steps: Option<usize>,

    // ── Hub ───────────────────────────────────────────────────────────────
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub push_to_hub: Option<bool>,
    #[arg(long)]
    pub hub_model_id: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub hub_private_repo: Option<bool>,
    /// end | push_best | push_last | checkpoint | all_checkpoints
    #[arg(long)]
    pub push_hub_strategy: Option<String>,
    #[arg(long)]
    pub hub_token: Option<String>,

    // ── Misc ──────────────────────────────────────────────────────────────
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub test_oom_error: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub use_flash_attn: Option<bool>,
    /// Warn about unrecognized arguments instead of failing.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub ignore_args_error: Option<bool>,
    #[arg(long)]
    pub logging_dir: Option<PathBuf>,
    #[arg(long, num_args = 1..)]
    pub report_to: Option<Vec<String>>,

    // ── Generation ────────────────────────────────────────────────────────
    #[arg(long)]
    pub max_new_tokens: Option<usize>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub do_sample: Option<bool>,
    #[arg(long)]
    pub temperature: Option<f64>,
    #[arg(long)]
    pub top_k: Option<usize>,
    #[arg(long)]
    pub top_p: Option<f64>,
    #[arg(long)]
    pub repetition_penalty: Option<f64>,

    // ── Inference ─────────────────────────────────────────────────────────
    /// Checkpoint directory produced by `tunellm train`.
    #[arg(long)]
    pub ckpt_dir: Option<PathBuf>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub load_args_from_ckpt_dir: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub eval_human: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub save_result: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub stream: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub merge_lora_and_save: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub overwrite_generation_config: Option<bool>,
    /// Legacy spelling of `--val-dataset-sample`.
    #[arg(long, allow_hyphen_values = true)]
    pub show_dataset_sample: Option<i64>,
}

impl RunFlags {
    /// Overwrite every field of `base` for which a flag was given.
    pub fn apply(&self, base: RunConfig) -> anyhow::Result<RunConfig> {
        let hub_token = self.hub_token.clone().or_else(|| base.hub_token.clone());

        let Value::Object(mut merged) = serde_json::to_value(&base)? else {
            anyhow::bail!("run configuration did not serialize to an object");
        };
        let Value::Object(flags) = serde_json::to_value(self)? else {
            anyhow::bail!("flags did not serialize to an object");
        };
        for (key, value) in flags {
            if !value.is_null() {
                merged.insert(key, value);
            }
        }

        let mut cfg: RunConfig =
            serde_json::from_value(Value::Object(merged)).context("Invalid command-line arguments")?;
        cfg.hub_token = hub_token;
        Ok(cfg)
    }
}
