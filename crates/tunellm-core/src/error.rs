use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid value for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("`{field}`: path does not exist: '{}'", .path.display())]
    PathNotFound { field: String, path: PathBuf },

    #[error(
        "`model_type` ('{model_type}') and `model_id_or_path` ('{model_id_or_path}') \
         are mutually exclusive, set only one of them"
    )]
    AmbiguousModelSpec {
        model_type: String,
        model_id_or_path: String,
    },

    #[error("`model_id_or_path`: '{path}' is not registered.{}", cache_dir_hint(.exists_on_disk))]
    UnregisteredModel { path: String, exists_on_disk: bool },

    #[error("`model_type`: '{0}' is not registered")]
    UnknownModelType(String),

    #[error("`quantization_bit`: {0} is not supported, choose one of 0, 4 or 8")]
    InvalidQuantization(i64),

    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("Requirement '{requirement}' not satisfied: {reason}")]
    DependencyVersion { requirement: String, reason: String },

    #[error("`ddp_backend`: '{backend}' cannot be used {reason}")]
    UnsupportedBackend { backend: String, reason: String },

    #[error("Collective communication error: {0}")]
    Collective(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ResolveError {
    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

fn cache_dir_hint(exists_on_disk: &bool) -> &'static str {
    if *exists_on_disk {
        " Please use `model_cache_dir` to specify the local cache path for the model."
    } else {
        ""
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Non-fatal conditions raised while resolving a configuration.
///
/// Every entry is logged at `warn` level when pushed and kept so callers (and
/// tests) can inspect what was adjusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.0.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// `true` if any warning contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.0.iter().any(|w| w.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_not_found_names_field_and_path() {
        let err = ResolveError::PathNotFound {
            field: "ckpt_dir".to_string(),
            path: PathBuf::from("/no/such/dir"),
        };
        let msg = err.to_string();
        assert!(msg.contains("ckpt_dir"));
        assert!(msg.contains("/no/such/dir"));
    }

    #[test]
    fn test_unregistered_model_suggests_cache_dir_only_when_path_exists() {
        let on_disk = ResolveError::UnregisteredModel {
            path: "/models/foo".to_string(),
            exists_on_disk: true,
        };
        assert!(on_disk.to_string().contains("model_cache_dir"));

        let remote = ResolveError::UnregisteredModel {
            path: "org/foo".to_string(),
            exists_on_disk: false,
        };
        assert!(!remote.to_string().contains("model_cache_dir"));
    }

    #[test]
    fn test_invalid_quantization_embeds_value() {
        assert!(ResolveError::InvalidQuantization(3).to_string().contains('3'));
    }
}
