use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};
use tunellm_core::{
    limit_history_length, DistributedTopology, ResolvedConfig, RunConfig, RunMode, TemplateEncoder, Tokenizer, Turn,
};

use crate::commands::{build_resolver, summary};
use crate::config::AppConfig;

/// Resolve an inference run. When a query is given, also fit the
/// conversation history into the context window with the checkpoint's
/// tokenizer and report what was kept.
pub fn run(
    args: RunConfig,
    query: Option<&str>,
    history_file: Option<&Path>,
    gpu: bool,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let mut resolver = build_resolver(config, gpu, DistributedTopology::single_process())?;
    let resolved = resolver
        .resolve(args, RunMode::Infer)
        .context("Failed to resolve inference arguments")?;

    let mut report = summary(&resolved);
    report["merged_dir"] = serde_json::json!(resolved.merged_dir());

    if let Some(query) = query {
        let history = match history_file {
            Some(path) => read_history(path)?,
            None => Vec::new(),
        };
        match find_tokenizer(&resolved) {
            Some(tokenizer) => {
                let encoder = TemplateEncoder::new(&tokenizer, resolved.template_type());
                let truncation = limit_history_length(
                    &encoder,
                    query,
                    &history,
                    &resolved.args().system,
                    resolved.max_length(),
                )?;
                info!(
                    kept = truncation.history.len(),
                    dropped = truncation.old_history.len(),
                    "Fitted conversation history into the context window"
                );
                report["history"] = serde_json::json!({
                    "kept": truncation.history,
                    "dropped": truncation.old_history,
                });
            }
            None => warn!("No tokenizer.json in ckpt_dir or model_cache_dir, history left untruncated"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_history(path: &Path) -> anyhow::Result<Vec<Turn>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("{} is not a JSON list of turns", path.display()))
}

fn find_tokenizer(resolved: &ResolvedConfig) -> Option<Tokenizer> {
    let args = resolved.args();
    [args.ckpt_dir.as_deref(), args.model_cache_dir.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|dir| Tokenizer::from_model_dir(dir).ok())
}
