//! Registry of known model types.
//!
//! The registry is an explicit object owned by the caller and passed into the
//! resolution pipeline. After construction its only mutation is
//! [`ModelRegistry::pin_revision`], used when a user overrides the revision of
//! a registered model so later lookups in the same process agree.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ResolveError, ResolveResult};
use crate::precision::Precision;

/// Static description of one registered model type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Registry key, e.g. `qwen-7b-chat`.
    pub model_type: String,
    /// Canonical hub id or local path.
    pub model_id_or_path: String,
    pub revision: String,
    #[serde(default)]
    pub support_flash_attn: bool,
    /// Native precision of the published weights, if fixed.
    #[serde(default)]
    pub torch_dtype: Option<Precision>,
    pub lora_target_modules: Vec<String>,
    pub template_type: String,
    /// Package requirements such as `auto_gptq>=0.4.2`.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl ModelDescriptor {
    fn new(
        model_type: &str,
        model_id_or_path: &str,
        revision: &str,
        template_type: &str,
        lora_target_modules: &[&str],
    ) -> Self {
        Self {
            model_type: model_type.to_string(),
            model_id_or_path: model_id_or_path.to_string(),
            revision: revision.to_string(),
            support_flash_attn: false,
            torch_dtype: None,
            lora_target_modules: lora_target_modules.iter().map(|s| s.to_string()).collect(),
            template_type: template_type.to_string(),
            requires: Vec::new(),
        }
    }

    fn flash_attn(mut self) -> Self {
        self.support_flash_attn = true;
        self
    }

    fn dtype(mut self, precision: Precision) -> Self {
        self.torch_dtype = Some(precision);
        self
    }

    fn requires(mut self, requirement: &str) -> Self {
        self.requires.push(requirement.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The model types shipped with tunellm.
    pub fn builtin() -> Self {
        let qwen_targets = ["c_attn"];
        let llama_targets = ["q_proj", "k_proj", "v_proj"];
        let mut registry = Self::empty();
        for descriptor in [
            ModelDescriptor::new("qwen-7b-chat", "qwen/Qwen-7B-Chat", "v1.1.4", "chatml", &qwen_targets)
                .flash_attn()
                .dtype(Precision::Bf16),
            ModelDescriptor::new("qwen-14b-chat", "qwen/Qwen-14B-Chat", "v1.0.4", "chatml", &qwen_targets)
                .flash_attn()
                .dtype(Precision::Bf16),
            ModelDescriptor::new(
                "qwen-7b-chat-int4",
                "qwen/Qwen-7B-Chat-Int4",
                "v1.1.4",
                "chatml",
                &qwen_targets,
            )
            .flash_attn()
            .dtype(Precision::Fp16)
            .requires("auto_gptq>=0.4.2"),
            ModelDescriptor::new(
                "chatglm3-6b",
                "ZhipuAI/chatglm3-6b",
                "v1.0.1",
                "chatglm3",
                &["query_key_value"],
            )
            .dtype(Precision::Bf16),
            ModelDescriptor::new(
                "llama2-7b-chat",
                "modelscope/Llama-2-7b-chat-ms",
                "v1.0.2",
                "llama",
                &llama_targets,
            )
            .flash_attn()
            .dtype(Precision::Fp16),
            ModelDescriptor::new(
                "baichuan2-7b-chat-int4",
                "baichuan-inc/Baichuan2-7B-Chat-4bits",
                "v1.0.0",
                "baichuan",
                &["W_pack"],
            )
            .dtype(Precision::Bf16)
            .requires("bitsandbytes"),
            ModelDescriptor::new(
                "mistral-7b-chat",
                "AI-ModelScope/Mistral-7B-Instruct-v0.1",
                "v1.0.0",
                "llama",
                &llama_targets,
            )
            .flash_attn()
            .dtype(Precision::Bf16)
            .requires("transformers>=4.34"),
        ] {
            registry.insert(descriptor);
        }
        registry
    }

    /// Add descriptors from a JSON array file, replacing existing entries with
    /// the same `model_type`.
    pub fn extend_from_json(&mut self, path: &Path) -> ResolveResult<usize> {
        let json = std::fs::read_to_string(path)?;
        let descriptors: Vec<ModelDescriptor> = serde_json::from_str(&json)?;
        let count = descriptors.len();
        for descriptor in descriptors {
            self.insert(descriptor);
        }
        info!(count, path = %path.display(), "Registered model types from file");
        Ok(count)
    }

    pub fn insert(&mut self, descriptor: ModelDescriptor) {
        self.entries.insert(descriptor.model_type.clone(), descriptor);
    }

    pub fn get(&self, model_type: &str) -> Option<&ModelDescriptor> {
        self.entries.get(model_type)
    }

    /// Look up a registered descriptor, failing with `UnknownModelType`.
    pub fn require(&self, model_type: &str) -> ResolveResult<&ModelDescriptor> {
        self.get(model_type)
            .ok_or_else(|| ResolveError::UnknownModelType(model_type.to_string()))
    }

    /// Case-insensitive reverse lookup from `model_id_or_path` to model type.
    pub fn find_by_model_id(&self, model_id_or_path: &str) -> Option<&str> {
        let wanted = model_id_or_path.to_lowercase();
        self.entries
            .values()
            .find(|d| d.model_id_or_path.to_lowercase() == wanted)
            .map(|d| d.model_type.as_str())
    }

    /// Record a user-supplied revision on the registry entry.
    pub fn pin_revision(&mut self, model_type: &str, revision: &str) -> ResolveResult<()> {
        let entry = self
            .entries
            .get_mut(model_type)
            .ok_or_else(|| ResolveError::UnknownModelType(model_type.to_string()))?;
        if entry.revision != revision {
            debug!(model_type, from = %entry.revision, to = revision, "Pinning model revision");
            entry.revision = revision.to_string();
        }
        Ok(())
    }

    pub fn model_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
