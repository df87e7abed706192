use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunellm_core::{DistributedTopology, RunConfig};

mod commands;
mod config;
mod flags;

use config::{load_config, AppConfig};
use flags::RunFlags;

/// tunellm: resolve and prepare LLM fine-tuning, inference and adapter merges
#[derive(Debug, Parser)]
#[command(name = "tunellm", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    /// Prefer GPU acceleration (CUDA/Metal).
    #[arg(long, global = true)]
    gpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    #[command(flatten)]
    flags: RunFlags,

    /// Unrecognized trailing arguments; rejected unless `--ignore-args-error`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    leftover: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a fine-tuning run and write `sft_args.json` to its output directory.
    Train {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Resolve an inference run, optionally fitting a conversation into the
    /// context window.
    Infer {
        #[command(flatten)]
        common: CommonArgs,

        /// Current user query.
        #[arg(long)]
        query: Option<String>,

        /// JSON list of `{"query": .., "response": ..}` turns.
        #[arg(long, value_name = "FILE", requires = "query")]
        history: Option<PathBuf>,
    },

    /// Resolve an adapter merge into `<ckpt_dir>-merged`.
    MergeAdapter {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let topology = DistributedTopology::from_env();
    init_tracing(&cli.log_format, topology.is_master());

    let cfg = load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Train { common } => {
            let args = run_args(&common, &cfg)?;
            commands::train::run(args, cli.gpu, &cfg)?;
        }
        Commands::Infer { common, query, history } => {
            let args = run_args(&common, &cfg)?;
            commands::infer::run(args, query.as_deref(), history.as_deref(), cli.gpu, &cfg)?;
        }
        Commands::MergeAdapter { common } => {
            let args = run_args(&common, &cfg)?;
            commands::merge::run(args, cli.gpu, &cfg)?;
        }
    }

    Ok(())
}

/// Layer the command-line flags over the configured run arguments and deal
/// with anything clap could not place.
fn run_args(common: &CommonArgs, cfg: &AppConfig) -> anyhow::Result<RunConfig> {
    let args = common.flags.apply(cfg.run.clone())?;
    check_leftover(&common.leftover, args.ignore_args_error)?;
    Ok(args)
}

fn check_leftover(leftover: &[String], ignore_args_error: bool) -> anyhow::Result<()> {
    if leftover.is_empty() {
        return Ok(());
    }
    if ignore_args_error {
        warn!(?leftover, "Ignoring unrecognized arguments");
        Ok(())
    } else {
        anyhow::bail!("Unrecognized arguments: {leftover:?} (pass --ignore-args-error to continue anyway)")
    }
}

fn init_tracing(log_format: &str, is_master: bool) {
    // Non-master ranks only report errors unless RUST_LOG says otherwise.
    let default_level = if is_master { "info" } else { "error" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}
