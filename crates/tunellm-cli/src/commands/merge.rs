use anyhow::Context;
use tracing::info;
use tunellm_core::inherit::write_snapshot;
use tunellm_core::{DistributedTopology, RunConfig, RunMode};

use crate::commands::{build_resolver, summary};
use crate::config::AppConfig;

/// Resolve an adapter merge and prepare the merged-weights directory.
///
/// The arguments are persisted next to the merged weights so the merged model
/// can be used with `tunellm infer --ckpt-dir <merged>` directly.
pub fn run(args: RunConfig, gpu: bool, config: &AppConfig) -> anyhow::Result<()> {
    let mut resolver = build_resolver(config, gpu, DistributedTopology::single_process())?;
    let resolved = resolver
        .resolve(args, RunMode::MergeAdapter)
        .context("Failed to resolve merge-adapter arguments")?;

    let merged_dir = resolved
        .merged_dir()
        .context("merge-adapter resolved without a merged directory")?
        .to_path_buf();
    write_snapshot(resolved.args(), &merged_dir)
        .with_context(|| format!("Failed to prepare {}", merged_dir.display()))?;

    let mut report = summary(&resolved);
    report["merged_dir"] = serde_json::json!(merged_dir);
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(merged_dir = %merged_dir.display(), "Merge target prepared");
    Ok(())
}
