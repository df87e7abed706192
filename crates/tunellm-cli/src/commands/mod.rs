pub mod infer;
pub mod merge;
pub mod train;

use anyhow::Context;
use serde_json::json;
use tracing::info;
use tunellm_core::device::device_name;
use tunellm_core::{pin_device, DistributedTopology, HardwareCaps, ModelRegistry, ResolvedConfig, Resolver};

use crate::config::AppConfig;

/// Build a resolver from the layered configuration: registry (built-in plus
/// optional file), declared packages, and the device this rank is pinned to.
pub fn build_resolver(config: &AppConfig, gpu: bool, topology: DistributedTopology) -> anyhow::Result<Resolver> {
    let mut registry = ModelRegistry::builtin();
    if let Some(path) = &config.registry.models_file {
        registry
            .extend_from_json(path)
            .with_context(|| format!("Failed to load model registry file {}", path.display()))?;
    }

    let device = pin_device(gpu || config.device.prefer_gpu, topology.local_rank)?;
    info!(device = device_name(&device), rank = topology.rank, "Compute device selected");

    Ok(Resolver::new(registry)
        .with_caps(HardwareCaps::for_device(&device))
        .with_packages(config.packages.clone())
        .with_topology(topology))
}

/// Machine-readable summary printed by every subcommand.
pub fn summary(resolved: &ResolvedConfig) -> serde_json::Value {
    let precision = resolved.precision();
    let quantization = resolved.quantization();
    json!({
        "mode": resolved.mode(),
        "model_type": resolved.model_type(),
        "model_id_or_path": resolved.model_id_or_path(),
        "model_revision": resolved.model_revision(),
        "template_type": resolved.template_type(),
        "dataset": resolved.dataset(),
        "lora_target_modules": resolved.lora_target_modules(),
        "max_length": resolved.max_length(),
        "torch_dtype": precision.torch_dtype,
        "fp16": precision.fp16,
        "bf16": precision.bf16,
        "load_in_4bit": quantization.load_in_4bit,
        "load_in_8bit": quantization.load_in_8bit,
        "bnb_4bit_compute_dtype": quantization.compute_dtype,
        "output_dir": resolved.output_dir(),
        "seed": resolved.seed(),
        "topology": resolved.topology(),
        "inherited_from_checkpoint": resolved.inherited(),
        "warnings": resolved.warnings().iter().collect::<Vec<_>>(),
    })
}
