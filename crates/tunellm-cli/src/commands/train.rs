use anyhow::Context;
use tracing::info;
use tunellm_core::inherit::write_snapshot;
use tunellm_core::{local_leader_first, DistributedTopology, RunConfig, RunMode};

use crate::commands::{build_resolver, summary};
use crate::config::AppConfig;

/// Resolve a training run, prepare its output directory and persist the
/// resolved arguments for later inference.
pub fn run(args: RunConfig, gpu: bool, config: &AppConfig) -> anyhow::Result<()> {
    let topology = DistributedTopology::from_env();
    let mut resolver = build_resolver(config, gpu, topology)?;
    let resolved = resolver
        .resolve(args, RunMode::Train)
        .context("Failed to resolve training arguments")?;

    let output_dir = resolved.output_dir().to_path_buf();
    let collective = resolver.collective();
    local_leader_first(collective.as_deref(), &topology, || {
        std::fs::create_dir_all(&output_dir)?;
        if topology.is_master() {
            write_snapshot(resolved.args(), &output_dir)?;
        }
        Ok(())
    })
    .with_context(|| format!("Failed to prepare output directory {}", output_dir.display()))?;

    if topology.is_master() {
        let mut report = summary(&resolved);
        if let Some(plan) = resolved.training() {
            report["training"] = serde_json::json!({
                "learning_rate": plan.learning_rate,
                "only_save_model": plan.only_save_model,
                "save_steps": plan.save_steps,
                "eval_batch_size": plan.eval_batch_size,
                "save_total_limit": plan.save_total_limit,
                "train_sampler_random": plan.train_sampler_random,
                "logging_dir": plan.logging_dir,
                "report_to": plan.report_to,
                "deepspeed": plan.deepspeed,
                "hub_model_id": plan.hub_model_id,
            });
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    info!(output_dir = %output_dir.display(), "Training run prepared");
    Ok(())
}
