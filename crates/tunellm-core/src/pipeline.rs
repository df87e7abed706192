//! The configuration resolution pipeline.
//!
//! [`Resolver::resolve`] runs an ordered list of passes over a sparse
//! [`RunConfig`]:
//!
//! 1. compatibility aliases and path normalization;
//! 2. checkpoint inheritance (inference modes);
//! 3. model identity, flash-attention support;
//! 4. mode checks and defaults shared by every mode;
//! 5. versioned output directory (training);
//! 6. precision;
//! 7. distributed coordination (training);
//! 8. training derivations (learning rate, checkpointing, hub, ...);
//! 9. quantization;
//!
//! and finalizes the result into an immutable [`ResolvedConfig`] whose
//! derived fields are no longer optional.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::args::{DdpBackend, RunConfig, RunMode, SftType, AUTO, CUSTOM_DATASET, DEFAULT_DATASET, DEFAULT_TARGET_MODULES};
use crate::device::HardwareCaps;
use crate::distributed::{coordinate, Collective, DistributedTopology, ProcessGroup, RendezvousAddr, TcpGroup};
use crate::error::{ResolveError, ResolveResult, Warnings};
use crate::identity::{check_flash_attn, pin_identity, resolve_model_identity};
use crate::inherit::inherit_from_checkpoint;
use crate::normalize::{apply_compatibility, normalize_paths};
use crate::precision::{
    check_full_training, select_dtype, select_quantization, validate_quantization_bit, DtypeSelection, QuantizationPlan,
};
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::requirements::PackageVersions;
use crate::workdir::add_version_to_work_dir;

/// Environment variable consulted for the hub token.
pub const HUB_TOKEN_ENV: &str = "TUNELLM_HUB_TOKEN";

const ADAPTER_LEARNING_RATE: f64 = 1e-4;
const FULL_LEARNING_RATE: f64 = 2e-5;
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(300);

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;
type GroupInit = Box<dyn Fn(&DistributedTopology, DdpBackend) -> ResolveResult<Arc<dyn Collective>> + Send + Sync>;

/// Training-only derived settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPlan {
    pub learning_rate: f64,
    pub only_save_model: bool,
    pub save_steps: usize,
    pub eval_batch_size: usize,
    /// `None`: keep every checkpoint.
    pub save_total_limit: Option<usize>,
    pub train_sampler_random: bool,
    pub logging_dir: PathBuf,
    pub report_to: Vec<String>,
    /// Parsed deepspeed configuration document.
    pub deepspeed: Option<serde_json::Value>,
    pub hub_model_id: Option<String>,
}

/// Fully resolved, internally consistent run configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    mode: RunMode,
    args: RunConfig,
    model_type: String,
    model_id_or_path: String,
    model_revision: String,
    template_type: String,
    dataset: Vec<String>,
    lora_target_modules: Vec<String>,
    max_length: Option<usize>,
    precision: DtypeSelection,
    quantization: QuantizationPlan,
    topology: DistributedTopology,
    training: Option<TrainingPlan>,
    merged_dir: Option<PathBuf>,
    inherited: bool,
    warnings: Warnings,
}

impl ResolvedConfig {
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// The rewritten argument record, as persisted to `sft_args.json`.
    pub fn args(&self) -> &RunConfig {
        &self.args
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn model_id_or_path(&self) -> &str {
        &self.model_id_or_path
    }

    pub fn model_revision(&self) -> &str {
        &self.model_revision
    }

    pub fn template_type(&self) -> &str {
        &self.template_type
    }

    pub fn dataset(&self) -> &[String] {
        &self.dataset
    }

    pub fn lora_target_modules(&self) -> &[String] {
        &self.lora_target_modules
    }

    /// `None`: no length limit.
    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn precision(&self) -> DtypeSelection {
        self.precision
    }

    pub fn quantization(&self) -> QuantizationPlan {
        self.quantization
    }

    pub fn topology(&self) -> DistributedTopology {
        self.topology
    }

    pub fn output_dir(&self) -> &Path {
        &self.args.output_dir
    }

    pub fn seed(&self) -> u64 {
        self.args.seed
    }

    /// Present for [`RunMode::Train`] only.
    pub fn training(&self) -> Option<&TrainingPlan> {
        self.training.as_ref()
    }

    /// Where merged adapter weights are written.
    pub fn merged_dir(&self) -> Option<&Path> {
        self.merged_dir.as_deref()
    }

    /// Whether arguments were loaded from a checkpoint snapshot.
    pub fn inherited(&self) -> bool {
        self.inherited
    }

    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }
}

/// Owns everything resolution depends on besides the arguments themselves.
pub struct Resolver {
    registry: ModelRegistry,
    caps: HardwareCaps,
    installed: PackageVersions,
    topology: DistributedTopology,
    group: ProcessGroup,
    env: EnvLookup,
    group_init: GroupInit,
}

impl Resolver {
    /// A single-process resolver on bf16-capable hardware with nothing
    /// declared installed.
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            caps: HardwareCaps { bf16_supported: true },
            installed: PackageVersions::new(),
            topology: DistributedTopology::single_process(),
            group: ProcessGroup::new(),
            env: Box::new(|key| std::env::var(key).ok()),
            group_init: Box::new(|topology, _backend| {
                let group = TcpGroup::connect(
                    &RendezvousAddr::from_env(),
                    topology.rank,
                    topology.world_size,
                    RENDEZVOUS_TIMEOUT,
                )?;
                Ok(Arc::new(group) as Arc<dyn Collective>)
            }),
        }
    }

    pub fn with_caps(mut self, caps: HardwareCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_packages(mut self, installed: PackageVersions) -> Self {
        self.installed = installed;
        self
    }

    pub fn with_topology(mut self, topology: DistributedTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    /// Replace how the process group is created on first use.
    pub fn with_group_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&DistributedTopology, DdpBackend) -> ResolveResult<Arc<dyn Collective>> + Send + Sync + 'static,
    {
        self.group_init = Box::new(init);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn topology(&self) -> DistributedTopology {
        self.topology
    }

    /// The group initialized by the last distributed resolution, if any.
    pub fn collective(&self) -> Option<Arc<dyn Collective>> {
        self.group.get()
    }

    pub fn resolve(&mut self, cfg: RunConfig, mode: RunMode) -> ResolveResult<ResolvedConfig> {
        let mut warnings = Warnings::new();

        let cfg = apply_compatibility(cfg, mode);
        let mut cfg = normalize_paths(cfg)?;

        let mut inherited = false;
        if mode.is_inference() {
            if cfg.overwrite_generation_config && cfg.ckpt_dir.is_none() {
                warnings.push("overwrite_generation_config requires ckpt_dir, setting it to false");
                cfg.overwrite_generation_config = false;
            }
            (cfg, inherited) = inherit_from_checkpoint(cfg)?;
        }
        // Before any pass that branches on the bit width.
        validate_quantization_bit(cfg.quantization_bit)?;

        let cfg = match cfg.model_type.clone() {
            Some(model_type) if inherited => pin_identity(cfg, &model_type, &mut self.registry, &self.installed)?,
            _ => resolve_model_identity(cfg, &mut self.registry, &self.installed)?,
        };
        check_flash_attn(&cfg, &self.registry, &mut warnings)?;

        let model_type = cfg
            .model_type
            .clone()
            .ok_or_else(|| ResolveError::validation("model_type", "unresolved after identity pass"))?;
        let descriptor = self.registry.require(&model_type)?.clone();

        let merged_dir = check_mode(&cfg, mode)?;
        let mut cfg = apply_common_defaults(cfg, &descriptor);
        let max_length = resolve_max_length(cfg.max_length)?;

        if mode == RunMode::Train {
            check_full_training(&cfg)?;
            cfg = version_output_dir(cfg, &model_type, &self.topology);
        }

        let (mut cfg, precision) = select_dtype(cfg, &descriptor, self.caps, mode, &mut warnings);

        let mut training = None;
        if mode == RunMode::Train {
            let group_init = &self.group_init;
            cfg = coordinate(cfg, &self.topology, &self.group, |topology, backend| {
                group_init(topology, backend)
            })?;
            let (next, plan) = derive_training(cfg, &descriptor, self.env.as_ref())?;
            cfg = next;
            training = Some(plan);
        }

        let (cfg, quantization) = select_quantization(cfg, &self.installed)?;

        info!(
            mode = ?mode,
            model_type = %model_type,
            dtype = %precision.torch_dtype,
            quantization_bit = cfg.quantization_bit,
            output_dir = %cfg.output_dir.display(),
            warnings = warnings.iter().count(),
            "Resolved run configuration"
        );

        finalize(cfg, mode, FinalParts {
            max_length,
            precision,
            quantization,
            topology: self.topology,
            training,
            merged_dir,
            inherited,
            warnings,
        })
    }
}

/// Mode-specific preconditions. Returns the merged-weights directory when
/// the mode produces one.
fn check_mode(cfg: &RunConfig, mode: RunMode) -> ResolveResult<Option<PathBuf>> {
    let merged = |ckpt_dir: &Path| {
        let mut name = ckpt_dir.as_os_str().to_owned();
        name.push("-merged");
        PathBuf::from(name)
    };
    match mode {
        RunMode::MergeAdapter => {
            let Some(ckpt_dir) = cfg.ckpt_dir.as_deref() else {
                return Err(ResolveError::validation("ckpt_dir", "merge-adapter needs `--ckpt-dir`"));
            };
            if !cfg.sft_type.is_adapter() {
                return Err(ResolveError::UnsupportedCombination(format!(
                    "sft_type `{}` has no adapter weights to merge",
                    cfg.sft_type
                )));
            }
            Ok(Some(merged(ckpt_dir)))
        }
        RunMode::Infer if cfg.merge_lora_and_save => match cfg.ckpt_dir.as_deref() {
            Some(ckpt_dir) if cfg.sft_type.is_adapter() => Ok(Some(merged(ckpt_dir))),
            _ => Err(ResolveError::UnsupportedCombination(
                "merge_lora_and_save needs an adapter checkpoint in `ckpt_dir`".to_string(),
            )),
        },
        _ => Ok(None),
    }
}

/// Defaults every mode shares: template, datasets and target modules.
fn apply_common_defaults(mut cfg: RunConfig, descriptor: &ModelDescriptor) -> RunConfig {
    if cfg.template_type == AUTO {
        cfg.template_type = descriptor.template_type.clone();
    }

    let has_custom = cfg.custom_train_dataset_path.as_ref().is_some_and(|p| !p.is_empty())
        || cfg.custom_val_dataset_path.as_ref().is_some_and(|p| !p.is_empty());
    let dataset = cfg.dataset.get_or_insert_with(|| {
        if has_custom {
            Vec::new()
        } else {
            vec![DEFAULT_DATASET.to_string()]
        }
    });
    if has_custom && !dataset.iter().any(|d| d == CUSTOM_DATASET) {
        dataset.push(CUSTOM_DATASET.to_string());
    }

    cfg.lora_target_modules
        .get_or_insert_with(|| vec![DEFAULT_TARGET_MODULES.to_string()]);
    cfg
}

fn resolve_max_length(max_length: i64) -> ResolveResult<Option<usize>> {
    match max_length {
        -1 => Ok(None),
        n => usize::try_from(n)
            .map(Some)
            .map_err(|_| ResolveError::validation("max_length", format!("{n} must be non-negative or -1"))),
    }
}

/// `output_dir/<model_type>`, plus `v<N>-<timestamp>` on the master rank.
fn version_output_dir(mut cfg: RunConfig, model_type: &str, topology: &DistributedTopology) -> RunConfig {
    if !cfg.add_output_dir_suffix {
        return cfg;
    }
    cfg.output_dir = cfg.output_dir.join(model_type);
    if topology.is_master() {
        cfg.output_dir = add_version_to_work_dir(&cfg.output_dir);
    }
    cfg
}

fn expand_target_modules(modules: &[String], descriptor: &ModelDescriptor) -> ResolveResult<Vec<String>> {
    if !modules.iter().any(|m| m == DEFAULT_TARGET_MODULES) {
        return Ok(modules.to_vec());
    }
    if modules.len() != 1 {
        return Err(ResolveError::validation(
            "lora_target_modules",
            format!("`{DEFAULT_TARGET_MODULES}` cannot be combined with other modules: {modules:?}"),
        ));
    }
    Ok(descriptor.lora_target_modules.clone())
}

fn derive_training(
    mut cfg: RunConfig,
    descriptor: &ModelDescriptor,
    env: &(dyn Fn(&str) -> Option<String> + Send + Sync),
) -> ResolveResult<(RunConfig, TrainingPlan)> {
    let (learning_rate, only_save_model) = match cfg.sft_type {
        SftType::Full => (FULL_LEARNING_RATE, true),
        _ => (ADAPTER_LEARNING_RATE, cfg.deepspeed_config_path.is_some()),
    };
    let learning_rate = *cfg.learning_rate.get_or_insert(learning_rate);
    let only_save_model = *cfg.only_save_model.get_or_insert(only_save_model);
    let save_steps = *cfg.save_steps.get_or_insert(cfg.eval_steps);

    if let Some(modules) = cfg.lora_target_modules.as_deref() {
        cfg.lora_target_modules = Some(expand_target_modules(modules, descriptor)?);
    }

    let mut hub_model_id = None;
    if cfg.push_to_hub {
        let model_id = cfg
            .hub_model_id
            .get_or_insert_with(|| format!("{}-{}", descriptor.model_type, cfg.sft_type))
            .clone();
        if cfg.hub_token.is_none() {
            cfg.hub_token = env(HUB_TOKEN_ENV);
        }
        if cfg.hub_token.is_none() {
            return Err(ResolveError::validation(
                "hub_token",
                format!("push_to_hub is set but neither `hub_token` nor {HUB_TOKEN_ENV} is provided"),
            ));
        }
        hub_model_id = Some(model_id);
    }

    let eval_batch_size = *cfg
        .eval_batch_size
        .get_or_insert(if cfg.predict_with_generate { 1 } else { cfg.batch_size });

    let save_total_limit = match cfg.save_total_limit {
        -1 => None,
        n if n >= 0 => Some(n as usize),
        n => {
            return Err(ResolveError::validation("save_total_limit", format!("{n} must be >= 0 or -1")));
        }
    };

    let deepspeed = cfg
        .deepspeed_config_path
        .as_deref()
        .map(|path| -> ResolveResult<serde_json::Value> {
            debug!(path = %path.display(), "Loading deepspeed config");
            Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
        })
        .transpose()?;

    let logging_dir = cfg
        .logging_dir
        .get_or_insert_with(|| cfg.output_dir.join("runs"))
        .clone();
    let report_to = cfg
        .report_to
        .get_or_insert_with(|| vec!["all".to_string()])
        .clone();

    let plan = TrainingPlan {
        learning_rate,
        only_save_model,
        save_steps,
        eval_batch_size,
        save_total_limit,
        train_sampler_random: !cfg.test_oom_error,
        logging_dir,
        report_to,
        deepspeed,
        hub_model_id,
    };
    Ok((cfg, plan))
}

struct FinalParts {
    max_length: Option<usize>,
    precision: DtypeSelection,
    quantization: QuantizationPlan,
    topology: DistributedTopology,
    training: Option<TrainingPlan>,
    merged_dir: Option<PathBuf>,
    inherited: bool,
    warnings: Warnings,
}

fn finalize(args: RunConfig, mode: RunMode, parts: FinalParts) -> ResolveResult<ResolvedConfig> {
    let missing = |field: &str| ResolveError::validation(field, "unresolved after the pipeline");
    Ok(ResolvedConfig {
        mode,
        model_type: args.model_type.clone().ok_or_else(|| missing("model_type"))?,
        model_id_or_path: args.model_id_or_path.clone().ok_or_else(|| missing("model_id_or_path"))?,
        model_revision: args.model_revision.clone().ok_or_else(|| missing("model_revision"))?,
        template_type: args.template_type.clone(),
        dataset: args.dataset.clone().unwrap_or_default(),
        lora_target_modules: args.lora_target_modules.clone().unwrap_or_default(),
        max_length: parts.max_length,
        precision: parts.precision,
        quantization: parts.quantization,
        topology: parts.topology,
        training: parts.training,
        merged_dir: parts.merged_dir,
        inherited: parts.inherited,
        warnings: parts.warnings,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::DtypeRequest;
    use crate::distributed::LocalGroup;
    use crate::inherit::write_snapshot;
    use crate::precision::Precision;
    use std::thread;
    use tempfile::TempDir;

    fn resolver() -> Resolver {
        Resolver::new(ModelRegistry::builtin())
            .with_packages(PackageVersions::new().with("bitsandbytes", "0.41.0"))
            .with_env(|_| None)
    }

    fn train_cfg(out: &TempDir) -> RunConfig {
        RunConfig {
            output_dir: out.path().to_path_buf(),
            ..RunConfig::with_model_type("qwen-7b-chat")
        }
    }

    #[test]
    fn test_lora_training_defaults() {
        let out = TempDir::new().unwrap();
        let resolved = resolver().resolve(train_cfg(&out), RunMode::Train).unwrap();

        assert_eq!(resolved.model_id_or_path(), "qwen/Qwen-7B-Chat");
        assert_eq!(resolved.model_revision(), "v1.1.4");
        assert_eq!(resolved.template_type(), "chatml");
        assert_eq!(resolved.dataset(), ["blossom-math-zh".to_string()]);
        assert_eq!(resolved.lora_target_modules(), ["c_attn".to_string()]);
        assert_eq!(resolved.max_length(), Some(2048));
        assert_eq!(resolved.precision().torch_dtype, Precision::Bf16);

        let output_dir = resolved.output_dir();
        assert_eq!(output_dir.parent().unwrap(), out.path().join("qwen-7b-chat"));
        assert!(output_dir.file_name().unwrap().to_string_lossy().starts_with("v0-"));

        let plan = resolved.training().unwrap();
        assert_eq!(plan.learning_rate, 1e-4);
        assert!(!plan.only_save_model);
        assert_eq!(plan.save_steps, 50);
        assert_eq!(plan.eval_batch_size, 1);
        assert_eq!(plan.save_total_limit, Some(2));
        assert!(plan.train_sampler_random);
        assert_eq!(plan.logging_dir, output_dir.join("runs"));
        assert_eq!(plan.report_to, vec!["all".to_string()]);
        assert!(plan.hub_model_id.is_none());
    }

    #[test]
    fn test_full_training_in_fp16_loads_fp32_weights() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig {
            sft_type: SftType::Full,
            dtype: DtypeRequest::Fp16,
            save_total_limit: -1,
            max_length: -1,
            ..train_cfg(&out)
        };
        let resolved = resolver().resolve(cfg, RunMode::Train).unwrap();
        assert_eq!(resolved.precision().torch_dtype, Precision::Fp32);
        assert!(resolved.precision().fp16);
        assert!(resolved.warnings().mentions("fp32"));
        let plan = resolved.training().unwrap();
        assert_eq!(plan.learning_rate, 2e-5);
        assert!(plan.only_save_model);
        assert_eq!(plan.save_total_limit, None);
        assert_eq!(resolved.max_length(), None);
    }

    #[test]
    fn test_full_training_rejects_quantization() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig {
            sft_type: SftType::Full,
            quantization_bit: 4,
            ..train_cfg(&out)
        };
        assert!(matches!(
            resolver().resolve(cfg, RunMode::Train),
            Err(ResolveError::UnsupportedCombination(_))
        ));
    }

    #[test]
    fn test_invalid_quantization_bit() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig { quantization_bit: 3, ..train_cfg(&out) };
        assert!(matches!(
            resolver().resolve(cfg, RunMode::Train),
            Err(ResolveError::InvalidQuantization(3))
        ));
    }

    #[test]
    fn test_invalid_quantization_bit_wins_over_full_training_check() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig {
            sft_type: SftType::Full,
            quantization_bit: 3,
            ..train_cfg(&out)
        };
        assert!(matches!(
            resolver().resolve(cfg, RunMode::Train),
            Err(ResolveError::InvalidQuantization(3))
        ));
    }

    #[test]
    fn test_invalid_quantization_bit_rejected_before_rendezvous() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig {
            ddp_backend: DdpBackend::Gloo,
            quantization_bit: 5,
            ..train_cfg(&out)
        };
        let mut resolver = resolver()
            .with_topology(DistributedTopology::new(0, 0, 2, 2))
            .with_group_init(|_, _| panic!("must fail before initializing"));
        assert!(matches!(
            resolver.resolve(cfg, RunMode::Train),
            Err(ResolveError::InvalidQuantization(5))
        ));
        assert!(resolver.collective().is_none());
    }

    #[test]
    fn test_max_length_values() {
        assert_eq!(resolve_max_length(-1).unwrap(), None);
        assert_eq!(resolve_max_length(0).unwrap(), Some(0));
        assert_eq!(resolve_max_length(4096).unwrap(), Some(4096));
        assert!(matches!(
            resolve_max_length(-2),
            Err(ResolveError::Validation { field, .. }) if field == "max_length"
        ));
    }

    #[test]
    fn test_quantized_lora_plan() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig { quantization_bit: 4, ..train_cfg(&out) };
        let resolved = resolver().resolve(cfg, RunMode::Train).unwrap();
        let plan = resolved.quantization();
        assert!(plan.load_in_4bit && !plan.load_in_8bit);
        assert_eq!(plan.compute_dtype, Precision::Bf16);
    }

    #[test]
    fn test_default_target_modules_must_stand_alone() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig {
            lora_target_modules: Some(vec!["DEFAULT".to_string(), "w1".to_string()]),
            ..train_cfg(&out)
        };
        assert!(matches!(
            resolver().resolve(cfg, RunMode::Train),
            Err(ResolveError::Validation { field, .. }) if field == "lora_target_modules"
        ));
    }

    #[test]
    fn test_custom_dataset_registered_once() {
        let out = TempDir::new().unwrap();
        let data = out.path().join("train.jsonl");
        std::fs::write(&data, "{}\n").unwrap();
        let cfg = RunConfig {
            dataset: Some(vec!["alpaca,_custom_dataset".to_string()]),
            custom_train_dataset_path: Some(vec![data]),
            ..train_cfg(&out)
        };
        let resolved = resolver().resolve(cfg, RunMode::Train).unwrap();
        assert_eq!(resolved.dataset(), ["alpaca".to_string(), CUSTOM_DATASET.to_string()]);
    }

    #[test]
    fn test_push_to_hub_reads_token_from_env() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig { push_to_hub: true, ..train_cfg(&out) };
        let mut with_token = resolver().with_env(|k| (k == HUB_TOKEN_ENV).then(|| "secret".to_string()));
        let resolved = with_token.resolve(cfg.clone(), RunMode::Train).unwrap();
        assert_eq!(resolved.args().hub_token.as_deref(), Some("secret"));
        assert_eq!(
            resolved.training().unwrap().hub_model_id.as_deref(),
            Some("qwen-7b-chat-lora")
        );

        assert!(matches!(
            resolver().resolve(cfg, RunMode::Train),
            Err(ResolveError::Validation { field, .. }) if field == "hub_token"
        ));
    }

    #[test]
    fn test_deepspeed_config_is_loaded() {
        let out = TempDir::new().unwrap();
        let ds = out.path().join("ds.json");
        std::fs::write(&ds, r#"{"zero_optimization": {"stage": 2}}"#).unwrap();
        let cfg = RunConfig {
            deepspeed_config_path: Some(ds),
            ..train_cfg(&out)
        };
        let resolved = resolver().resolve(cfg, RunMode::Train).unwrap();
        let plan = resolved.training().unwrap();
        assert!(plan.only_save_model);
        assert_eq!(plan.deepspeed.as_ref().unwrap()["zero_optimization"]["stage"], 2);
    }

    #[test]
    fn test_infer_inherits_identity_from_snapshot() {
        let ckpt = TempDir::new().unwrap();
        let trained = RunConfig {
            model_type: Some("chatglm3-6b".to_string()),
            model_id_or_path: Some("ZhipuAI/chatglm3-6b".to_string()),
            model_revision: Some("v1.0.1".to_string()),
            dtype: DtypeRequest::Fp16,
            ..RunConfig::default()
        };
        write_snapshot(&trained, ckpt.path()).unwrap();

        let cfg = RunConfig {
            ckpt_dir: Some(ckpt.path().to_path_buf()),
            ..RunConfig::default()
        };
        let resolved = resolver().resolve(cfg, RunMode::Infer).unwrap();
        assert!(resolved.inherited());
        assert_eq!(resolved.model_type(), "chatglm3-6b");
        assert_eq!(resolved.template_type(), "chatglm3");
        assert_eq!(resolved.precision().torch_dtype, Precision::Fp16);
        assert_eq!(resolved.args().val_dataset_sample, Some(10));
        assert!(resolved.training().is_none());
    }

    #[test]
    fn test_infer_without_ckpt_disables_overwrite_generation_config() {
        let cfg = RunConfig {
            overwrite_generation_config: true,
            ..RunConfig::with_model_type("qwen-7b-chat")
        };
        let resolved = resolver().resolve(cfg, RunMode::Infer).unwrap();
        assert!(!resolved.args().overwrite_generation_config);
        assert!(!resolved.args().load_args_from_ckpt_dir);
        assert!(resolved.warnings().mentions("overwrite_generation_config"));
    }

    #[test]
    fn test_merge_adapter_requirements() {
        assert!(matches!(
            resolver().resolve(RunConfig::with_model_type("qwen-7b-chat"), RunMode::MergeAdapter),
            Err(ResolveError::Validation { field, .. }) if field == "ckpt_dir"
        ));

        let ckpt = TempDir::new().unwrap();
        let cfg = RunConfig {
            ckpt_dir: Some(ckpt.path().to_path_buf()),
            ..RunConfig::with_model_type("qwen-7b-chat")
        };
        let resolved = resolver().resolve(cfg.clone(), RunMode::MergeAdapter).unwrap();
        let expected = format!("{}-merged", ckpt.path().display());
        assert_eq!(resolved.merged_dir().unwrap(), Path::new(&expected));

        let full = RunConfig { sft_type: SftType::Full, ..cfg };
        assert!(matches!(
            resolver().resolve(full, RunMode::MergeAdapter),
            Err(ResolveError::UnsupportedCombination(_))
        ));
    }

    #[test]
    fn test_cpu_only_auto_dtype_falls_back_to_fp16() {
        let cfg = RunConfig::with_model_type("qwen-7b-chat");
        let mut resolver = resolver().with_caps(HardwareCaps { bf16_supported: false });
        let resolved = resolver.resolve(cfg, RunMode::Infer).unwrap();
        assert_eq!(resolved.precision().torch_dtype, Precision::Fp16);
        assert_eq!(resolved.args().dtype, DtypeRequest::Fp16);
    }

    #[test]
    fn test_distributed_ranks_share_output_dir() {
        const WORLD: usize = 3;
        let out = TempDir::new().unwrap();
        let base = out.path().to_path_buf();

        let handles: Vec<_> = LocalGroup::create(WORLD)
            .into_iter()
            .map(|member| {
                let base = base.clone();
                thread::spawn(move || {
                    let rank = member.rank();
                    let member: Arc<dyn Collective> = Arc::new(member);
                    let mut resolver = resolver()
                        .with_topology(DistributedTopology::new(rank, rank, WORLD, WORLD))
                        .with_group_init(move |_, _| Ok(member.clone()));
                    let cfg = RunConfig {
                        output_dir: base,
                        ..RunConfig::with_model_type("qwen-7b-chat")
                    };
                    let resolved = resolver.resolve(cfg, RunMode::Train).unwrap();
                    assert!(resolver.collective().is_some());
                    (rank, resolved)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let master_dir = results[0].1.output_dir().to_path_buf();
        assert!(master_dir.file_name().unwrap().to_string_lossy().starts_with("v0-"));
        for (rank, resolved) in &results {
            assert_eq!(resolved.output_dir(), master_dir);
            assert_eq!(resolved.seed(), 42 + *rank as u64);
            assert_eq!(resolved.training().unwrap().logging_dir, master_dir.join("runs"));
        }
    }

    #[test]
    fn test_distributed_gloo_with_quantization_is_rejected() {
        let out = TempDir::new().unwrap();
        let cfg = RunConfig {
            ddp_backend: DdpBackend::Gloo,
            quantization_bit: 8,
            ..train_cfg(&out)
        };
        let mut resolver = resolver()
            .with_topology(DistributedTopology::new(0, 0, 1, 1))
            .with_group_init(|_, _| panic!("must fail before initializing"));
        assert!(matches!(
            resolver.resolve(cfg, RunMode::Train),
            Err(ResolveError::UnsupportedBackend { .. })
        ));
    }
}
