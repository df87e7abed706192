//! # tunellm-core
//!
//! Run-configuration resolution and context-window management for tunellm.
//!
//! ## Resolution passes
//!
//! | Pass | Module |
//! |------|--------|
//! | Compatibility aliases, path normalization | [`normalize`] |
//! | Checkpoint-argument inheritance | [`inherit`] |
//! | Model identity | [`identity`], [`registry`], [`requirements`] |
//! | Precision and quantization | [`precision`], [`device`] |
//! | Distributed coordination | [`distributed`] |
//! | Ordering, mode derivations, finalization | [`pipeline`] |
//!
//! ## Inference-time helpers
//!
//! [`context::limit_history_length`] keeps the longest conversation suffix
//! that fits a token budget; [`labels::labels_to_string`] renders masked label
//! runs for inspection.
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Pin each rank to its CUDA device |
//! | `metal` | Enable Apple Metal GPU detection |

pub mod args;
pub mod chat_template;
pub mod context;
pub mod device;
pub mod distributed;
pub mod error;
pub mod identity;
pub mod inherit;
pub mod labels;
pub mod normalize;
pub mod pipeline;
pub mod precision;
pub mod registry;
pub mod requirements;
pub mod search;
pub mod tokenizer;
pub mod workdir;

pub use args::{RunConfig, RunMode};
pub use context::{limit_history_length, PromptEncoder, TemplateEncoder, Truncation, Turn};
pub use device::{pin_device, HardwareCaps};
pub use distributed::{local_leader_first, Collective, DistributedTopology};
pub use error::{ResolveError, ResolveResult, Warnings};
pub use labels::{labels_to_string, TokenDecoder, IGNORE_INDEX};
pub use pipeline::{ResolvedConfig, Resolver, TrainingPlan};
pub use registry::{ModelDescriptor, ModelRegistry};
pub use requirements::PackageVersions;
pub use tokenizer::Tokenizer;
