//! User-facing run arguments.
//!
//! [`RunConfig`] is the single record every workflow starts from. All fields
//! carry serde defaults, so any subset may be supplied from a config file,
//! environment variables, CLI flags or a checkpoint snapshot. Fields typed as
//! `Option<_>` (or holding an `Auto` / `"AUTO"` sentinel) are filled in by the
//! resolution pipeline in [`crate::pipeline`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Sentinel used by `template_type` and `lora_target_modules` meaning "pick
/// the registry default".
pub const AUTO: &str = "AUTO";
/// Expanded to the registry's default adapter target modules.
pub const DEFAULT_TARGET_MODULES: &str = "DEFAULT";
/// Dataset name registered when custom dataset files are supplied.
pub const CUSTOM_DATASET: &str = "_custom_dataset";
/// Dataset used when none is requested.
pub const DEFAULT_DATASET: &str = "blossom-math-zh";

/// Which top-level workflow the configuration is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Train,
    Infer,
    MergeAdapter,
}

impl RunMode {
    pub fn is_inference(&self) -> bool {
        matches!(self, Self::Infer | Self::MergeAdapter)
    }
}

/// Fine-tuning strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SftType {
    Lora,
    #[serde(rename = "longlora")]
    LongLora,
    #[serde(rename = "qalora")]
    QaLora,
    Full,
}

impl SftType {
    /// `true` for parameter-efficient (adapter) training.
    pub fn is_adapter(&self) -> bool {
        !matches!(self, Self::Full)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lora => "lora",
            Self::LongLora => "longlora",
            Self::QaLora => "qalora",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for SftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precision as requested by the user (`auto` defers to the resolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtypeRequest {
    #[serde(alias = "AUTO")]
    Auto,
    Bf16,
    Fp16,
    Fp32,
}

impl DtypeRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Bf16 => "bf16",
            Self::Fp16 => "fp16",
            Self::Fp32 => "fp32",
        }
    }
}

impl fmt::Display for DtypeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DtypeRequest {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "bf16" => Ok(Self::Bf16),
            "fp16" => Ok(Self::Fp16),
            "fp32" => Ok(Self::Fp32),
            other => Err(ResolveError::validation(
                "dtype",
                format!("'{other}' is not one of auto, bf16, fp16, fp32"),
            )),
        }
    }
}

/// Collective communication backend requested for distributed training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdpBackend {
    Nccl,
    Gloo,
    Mpi,
    Ccl,
}

impl fmt::Display for DdpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nccl => "nccl",
            Self::Gloo => "gloo",
            Self::Mpi => "mpi",
            Self::Ccl => "ccl",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    Ignore,
    TruncationLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckDatasetStrategy {
    None,
    Discard,
    Error,
    Warning,
}

/// 4-bit quantization data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    Fp4,
    Nf4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushHubStrategy {
    End,
    PushBest,
    PushLast,
    Checkpoint,
    AllCheckpoints,
}

/// Every user-facing field of a train / infer / merge-adapter run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    // ── Model identity ────────────────────────────────────────────────────
    pub model_type: Option<String>,
    pub model_id_or_path: Option<String>,
    pub model_revision: Option<String>,
    pub model_cache_dir: Option<PathBuf>,

    pub sft_type: SftType,
    pub template_type: String,
    pub output_dir: PathBuf,
    pub add_output_dir_suffix: bool,
    pub ddp_backend: DdpBackend,

    pub seed: u64,
    pub resume_from_checkpoint: Option<PathBuf>,
    pub dtype: DtypeRequest,

    // ── Dataset ───────────────────────────────────────────────────────────
    pub dataset: Option<Vec<String>>,
    pub dataset_seed: u64,
    pub dataset_test_ratio: f64,
    /// -1: the whole dataset.
    pub train_dataset_sample: i64,
    /// -1: the whole dataset.
    pub val_dataset_sample: Option<i64>,
    pub system: String,
    /// -1: no limit.
    pub max_length: i64,
    pub truncation_strategy: TruncationStrategy,
    pub check_dataset_strategy: CheckDatasetStrategy,
    pub custom_train_dataset_path: Option<Vec<PathBuf>>,
    pub custom_val_dataset_path: Option<Vec<PathBuf>>,

    // ── Quantization ──────────────────────────────────────────────────────
    pub quantization_bit: i64,
    pub bnb_4bit_comp_dtype: DtypeRequest,
    pub bnb_4bit_quant_type: QuantType,
    pub bnb_4bit_use_double_quant: bool,

    // ── Adapter ───────────────────────────────────────────────────────────
    pub lora_target_modules: Option<Vec<String>>,
    pub lora_rank: u32,
    pub lora_alpha: u32,
    pub lora_dropout_p: f64,

    // ── Training loop ─────────────────────────────────────────────────────
    pub gradient_checkpointing: bool,
    pub deepspeed_config_path: Option<PathBuf>,
    pub batch_size: usize,
    pub eval_batch_size: Option<usize>,
    pub num_train_epochs: u32,
    /// Overrides `num_train_epochs` when >= 0.
    pub max_steps: i64,
    pub optim: String,
    pub learning_rate: Option<f64>,
    pub weight_decay: f64,
    pub gradient_accumulation_steps: usize,
    pub max_grad_norm: f64,
    pub predict_with_generate: bool,
    pub lr_scheduler_type: String,
    pub warmup_ratio: f64,
    pub eval_steps: usize,
    pub save_steps: Option<usize>,
    pub only_save_model: Option<bool>,
    /// -1: keep every checkpoint.
    pub save_total_limit: i64,
    pub logging_steps: usize,

    // ── Hub ───────────────────────────────────────────────────────────────
    pub push_to_hub: bool,
    pub hub_model_id: Option<String>,
    pub hub_private_repo: bool,
    pub push_hub_strategy: PushHubStrategy,
    #[serde(skip_serializing)]
    pub hub_token: Option<String>,

    // ── Misc ──────────────────────────────────────────────────────────────
    pub test_oom_error: bool,
    pub use_flash_attn: Option<bool>,
    pub ignore_args_error: bool,
    pub logging_dir: Option<PathBuf>,
    pub report_to: Option<Vec<String>>,

    // ── Generation ────────────────────────────────────────────────────────
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub repetition_penalty: f64,

    // ── Inference ─────────────────────────────────────────────────────────
    pub ckpt_dir: Option<PathBuf>,
    pub load_args_from_ckpt_dir: bool,
    pub eval_human: bool,
    pub save_result: bool,
    pub stream: bool,
    pub merge_lora_and_save: bool,
    pub overwrite_generation_config: bool,
    /// Legacy spelling of `val_dataset_sample`.
    pub show_dataset_sample: i64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_type: None,
            model_id_or_path: None,
            model_revision: None,
            model_cache_dir: None,
            sft_type: SftType::Lora,
            template_type: AUTO.to_string(),
            output_dir: PathBuf::from("output"),
            add_output_dir_suffix: true,
            ddp_backend: DdpBackend::Nccl,
            seed: 42,
            resume_from_checkpoint: None,
            dtype: DtypeRequest::Auto,
            dataset: None,
            dataset_seed: 42,
            dataset_test_ratio: 0.01,
            train_dataset_sample: 20_000,
            val_dataset_sample: None,
            system: "you are a helpful assistant!".to_string(),
            max_length: 2048,
            truncation_strategy: TruncationStrategy::TruncationLeft,
            check_dataset_strategy: CheckDatasetStrategy::None,
            custom_train_dataset_path: None,
            custom_val_dataset_path: None,
            quantization_bit: 0,
            bnb_4bit_comp_dtype: DtypeRequest::Auto,
            bnb_4bit_quant_type: QuantType::Nf4,
            bnb_4bit_use_double_quant: true,
            lora_target_modules: None,
            lora_rank: 8,
            lora_alpha: 32,
            lora_dropout_p: 0.05,
            gradient_checkpointing: true,
            deepspeed_config_path: None,
            batch_size: 1,
            eval_batch_size: None,
            num_train_epochs: 1,
            max_steps: -1,
            optim: "adamw_torch".to_string(),
            learning_rate: None,
            weight_decay: 0.01,
            gradient_accumulation_steps: 16,
            max_grad_norm: 0.5,
            predict_with_generate: false,
            lr_scheduler_type: "cosine".to_string(),
            warmup_ratio: 0.05,
            eval_steps: 50,
            save_steps: None,
            only_save_model: None,
            save_total_limit: 2,
            logging_steps: 5,
            push_to_hub: false,
            hub_model_id: None,
            hub_private_repo: true,
            push_hub_strategy: PushHubStrategy::PushBest,
            hub_token: None,
            test_oom_error: false,
            use_flash_attn: None,
            ignore_args_error: false,
            logging_dir: None,
            report_to: None,
            max_new_tokens: 2048,
            do_sample: true,
            temperature: 0.3,
            top_k: 20,
            top_p: 0.7,
            repetition_penalty: 1.05,
            ckpt_dir: None,
            load_args_from_ckpt_dir: true,
            eval_human: false,
            save_result: true,
            stream: true,
            merge_lora_and_save: false,
            overwrite_generation_config: false,
            show_dataset_sample: 10,
        }
    }
}

impl RunConfig {
    /// Convenience constructor used heavily by tests.
    pub fn with_model_type(model_type: &str) -> Self {
        Self {
            model_type: Some(model_type.to_string()),
            ..Self::default()
        }
    }
}
