use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tunellm_core::{PackageVersions, RunConfig};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Base run arguments; CLI flags are layered on top.
    #[serde(default)]
    pub run: RunConfig,
    /// Declared versions of the external packages the trainer runs with.
    #[serde(default)]
    pub packages: PackageVersions,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// JSON array of extra model descriptors.
    pub models_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { prefer_gpu: true }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `TUNELLM_`, nested with `__`
///    (`TUNELLM_RUN__MODEL_TYPE`, `TUNELLM_PACKAGES__BITSANDBYTES`)
pub fn load_config(config_file: Option<&Path>) -> Result<AppConfig, ConfigError> {
    load_config_with_env(config_file, Environment::with_prefix("TUNELLM"))
}

fn load_config_with_env(config_file: Option<&Path>, env: Environment) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("device.prefer_gpu", true)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    // Layer 4: environment variables
    builder = builder.add_source(env.prefix_separator("_").separator("__").try_parsing(true));

    builder.build()?.try_deserialize()
}
