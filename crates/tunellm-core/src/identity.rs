//! Model-identity resolution: reconcile `model_type` with `model_id_or_path`
//! against the registry.

use std::path::Path;

use tracing::info;

use crate::args::RunConfig;
use crate::error::{ResolveError, ResolveResult, Warnings};
use crate::registry::ModelRegistry;
use crate::requirements::PackageVersions;

/// Resolve the model identity.
///
/// Preconditions: paths already normalized.
/// Postconditions: `model_type`, `model_id_or_path` and `model_revision` are
/// set and registered; every package requirement of the model is satisfied.
/// An explicitly supplied revision is pinned on the registry entry.
pub fn resolve_model_identity(
    mut cfg: RunConfig,
    registry: &mut ModelRegistry,
    installed: &PackageVersions,
) -> ResolveResult<RunConfig> {
    if let (Some(model_type), Some(model_id_or_path)) = (&cfg.model_type, &cfg.model_id_or_path) {
        return Err(ResolveError::AmbiguousModelSpec {
            model_type: model_type.clone(),
            model_id_or_path: model_id_or_path.clone(),
        });
    }

    if let Some(model_id_or_path) = &cfg.model_id_or_path {
        let model_type = registry
            .find_by_model_id(model_id_or_path)
            .ok_or_else(|| ResolveError::UnregisteredModel {
                path: model_id_or_path.clone(),
                exists_on_disk: Path::new(model_id_or_path).exists(),
            })?;
        cfg.model_type = Some(model_type.to_string());
    }

    let Some(model_type) = cfg.model_type.clone() else {
        return Err(ResolveError::validation(
            "model_type",
            "please set `--model-type xxx` or `--model-id-or-path xxx`",
        ));
    };
    pin_identity(cfg, &model_type, registry, installed)
}

/// Fill revision and canonical id for an already known `model_type` and check
/// its requirements.
///
/// Used directly when the identity comes from a checkpoint snapshot, which
/// carries both `model_type` and `model_id_or_path`.
pub fn pin_identity(
    mut cfg: RunConfig,
    model_type: &str,
    registry: &mut ModelRegistry,
    installed: &PackageVersions,
) -> ResolveResult<RunConfig> {
    registry.require(model_type)?;

    if let Some(revision) = cfg.model_revision.clone() {
        registry.pin_revision(model_type, &revision)?;
    } else {
        cfg.model_revision = Some(registry.require(model_type)?.revision.clone());
    }

    let descriptor = registry.require(model_type)?;
    cfg.model_id_or_path = Some(descriptor.model_id_or_path.clone());
    installed.require_all(&descriptor.requires)?;

    info!(
        model_type,
        model_id_or_path = %descriptor.model_id_or_path,
        revision = %descriptor.revision,
        "Resolved model identity"
    );
    Ok(cfg)
}

/// Warn when flash attention is requested for a model without support.
pub fn check_flash_attn(cfg: &RunConfig, registry: &ModelRegistry, warnings: &mut Warnings) -> ResolveResult<()> {
    let Some(model_type) = cfg.model_type.as_deref() else {
        return Ok(());
    };
    let supported = registry.require(model_type)?.support_flash_attn;
    if cfg.use_flash_attn == Some(true) && !supported {
        warnings.push(format!(
            "use_flash_attn: true, but model type '{model_type}' does not support flash attention"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolve(cfg: RunConfig) -> ResolveResult<RunConfig> {
        let mut registry = ModelRegistry::builtin();
        resolve_model_identity(cfg, &mut registry, &PackageVersions::new())
    }

    #[test]
    fn test_model_type_resolves_with_default_revision() {
        let cfg = resolve(RunConfig::with_model_type("qwen-7b-chat")).unwrap();
        assert_eq!(cfg.model_id_or_path.as_deref(), Some("qwen/Qwen-7B-Chat"));
        assert_eq!(cfg.model_revision.as_deref(), Some("v1.1.4"));
    }

    #[test]
    fn test_model_id_reverse_lookup() {
        let cfg = RunConfig {
            model_id_or_path: Some("ZhipuAI/ChatGLM3-6B".to_string()),
            ..RunConfig::default()
        };
        let cfg = resolve(cfg).unwrap();
        assert_eq!(cfg.model_type.as_deref(), Some("chatglm3-6b"));
        assert_eq!(cfg.model_id_or_path.as_deref(), Some("ZhipuAI/chatglm3-6b"));
    }

    #[test]
    fn test_both_identity_fields_is_ambiguous() {
        let cfg = RunConfig {
            model_type: Some("qwen-7b-chat".to_string()),
            model_id_or_path: Some("qwen/Qwen-7B-Chat".to_string()),
            ..RunConfig::default()
        };
        assert!(matches!(resolve(cfg), Err(ResolveError::AmbiguousModelSpec { .. })));
    }

    #[test]
    fn test_ambiguity_is_reported_even_for_unknown_values() {
        let cfg = RunConfig {
            model_type: Some("nope".to_string()),
            model_id_or_path: Some("/also/nope".to_string()),
            ..RunConfig::default()
        };
        assert!(matches!(resolve(cfg), Err(ResolveError::AmbiguousModelSpec { .. })));
    }

    #[test]
    fn test_neither_identity_field_is_validation_error() {
        assert!(matches!(
            resolve(RunConfig::default()),
            Err(ResolveError::Validation { field, .. }) if field == "model_type"
        ));
    }

    #[test]
    fn test_unknown_model_type() {
        assert!(matches!(
            resolve(RunConfig::with_model_type("gpt-17")),
            Err(ResolveError::UnknownModelType(t)) if t == "gpt-17"
        ));
    }

    #[test]
    fn test_unregistered_local_path_suggests_cache_dir() {
        let dir = TempDir::new().unwrap();
        let cfg = RunConfig {
            model_id_or_path: Some(dir.path().to_string_lossy().into_owned()),
            ..RunConfig::default()
        };
        match resolve(cfg) {
            Err(err @ ResolveError::UnregisteredModel { exists_on_disk: true, .. }) => {
                assert!(err.to_string().contains("model_cache_dir"));
            }
            other => panic!("expected UnregisteredModel, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_revision_is_pinned_on_registry() {
        let mut registry = ModelRegistry::builtin();
        let cfg = RunConfig {
            model_revision: Some("v2.0.0".to_string()),
            ..RunConfig::with_model_type("qwen-7b-chat")
        };
        let cfg = resolve_model_identity(cfg, &mut registry, &PackageVersions::new()).unwrap();
        assert_eq!(cfg.model_revision.as_deref(), Some("v2.0.0"));
        assert_eq!(registry.get("qwen-7b-chat").unwrap().revision, "v2.0.0");
    }

    #[test]
    fn test_unmet_requirement_fails() {
        let cfg = RunConfig::with_model_type("qwen-7b-chat-int4");
        assert!(matches!(resolve(cfg), Err(ResolveError::DependencyVersion { .. })));

        let mut registry = ModelRegistry::builtin();
        let installed = PackageVersions::new().with("auto_gptq", "0.5.0");
        let cfg = RunConfig::with_model_type("qwen-7b-chat-int4");
        assert!(resolve_model_identity(cfg, &mut registry, &installed).is_ok());
    }

    #[test]
    fn test_flash_attn_unsupported_only_warns() {
        let registry = ModelRegistry::builtin();
        let mut warnings = Warnings::new();
        let cfg = RunConfig {
            use_flash_attn: Some(true),
            ..RunConfig::with_model_type("chatglm3-6b")
        };
        check_flash_attn(&cfg, &registry, &mut warnings).unwrap();
        assert!(warnings.mentions("flash attention"));

        let mut warnings = Warnings::new();
        let cfg = RunConfig {
            use_flash_attn: Some(true),
            ..RunConfig::with_model_type("qwen-7b-chat")
        };
        check_flash_attn(&cfg, &registry, &mut warnings).unwrap();
        assert!(warnings.is_empty());
    }
}
