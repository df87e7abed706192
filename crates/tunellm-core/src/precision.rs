//! Compute-precision and quantization resolution.

use std::fmt;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::args::{DtypeRequest, RunConfig, RunMode, SftType};
use crate::device::HardwareCaps;
use crate::error::{ResolveError, ResolveResult, Warnings};
use crate::registry::ModelDescriptor;
use crate::requirements::PackageVersions;

/// One of the three concrete floating-point precisions a run can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp16,
    Bf16,
    Fp32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
            Self::Fp32 => "fp32",
        }
    }

    /// Tensor element type used when loading weights at this precision.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::Fp32 => DType::F32,
        }
    }

    /// `None` for `auto`, which has no concrete precision yet.
    pub fn from_request(request: DtypeRequest) -> Option<Self> {
        match request {
            DtypeRequest::Auto => None,
            DtypeRequest::Bf16 => Some(Self::Bf16),
            DtypeRequest::Fp16 => Some(Self::Fp16),
            DtypeRequest::Fp32 => Some(Self::Fp32),
        }
    }
}

impl From<Precision> for DtypeRequest {
    fn from(p: Precision) -> Self {
        match p {
            Precision::Fp16 => DtypeRequest::Fp16,
            Precision::Bf16 => DtypeRequest::Bf16,
            Precision::Fp32 => DtypeRequest::Fp32,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`select_dtype`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtypeSelection {
    /// Precision weights are loaded in.
    pub torch_dtype: Precision,
    /// fp16 mixed precision enabled.
    pub fp16: bool,
    /// bf16 mixed precision enabled.
    pub bf16: bool,
}

/// Resolve `cfg.dtype` to a concrete precision.
///
/// Precedence for `auto`:
/// 1. hardware without bf16 support → fp16;
/// 2. pre-quantized model types (`int4` / `int8` in the name) adopt the
///    descriptor's native precision when it declares one;
/// 3. bf16.
///
/// `cfg.dtype` is rewritten to the concrete request. Full-parameter training
/// in fp16 loads weights in fp32 (fp16 autocast stays on) and records a
/// warning.
pub fn select_dtype(
    mut cfg: RunConfig,
    descriptor: &ModelDescriptor,
    caps: HardwareCaps,
    mode: RunMode,
    warnings: &mut Warnings,
) -> (RunConfig, DtypeSelection) {
    if cfg.dtype == DtypeRequest::Auto && !caps.bf16_supported {
        cfg.dtype = DtypeRequest::Fp16;
    }
    if cfg.dtype == DtypeRequest::Auto && is_prequantized(&descriptor.model_type) {
        if let Some(native) = descriptor.torch_dtype {
            cfg.dtype = native.into();
        }
    }
    let precision = Precision::from_request(cfg.dtype).unwrap_or(Precision::Bf16);
    cfg.dtype = precision.into();

    let selection = match precision {
        Precision::Fp16 => {
            let torch_dtype = if mode == RunMode::Train && cfg.sft_type == SftType::Full {
                warnings.push("fp16 full-parameter training is unstable, setting torch_dtype: fp32");
                Precision::Fp32
            } else {
                Precision::Fp16
            };
            DtypeSelection { torch_dtype, fp16: true, bf16: false }
        }
        Precision::Bf16 => {
            if !caps.bf16_supported {
                warnings.push("bf16 requested but the device does not support bf16");
            }
            DtypeSelection { torch_dtype: Precision::Bf16, fp16: false, bf16: true }
        }
        Precision::Fp32 => DtypeSelection { torch_dtype: Precision::Fp32, fp16: false, bf16: false },
    };
    (cfg, selection)
}

fn is_prequantized(model_type: &str) -> bool {
    model_type.contains("int4") || model_type.contains("int8")
}

/// Outcome of [`select_quantization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationPlan {
    /// Compute precision for 4-bit matmuls.
    pub compute_dtype: Precision,
    pub load_in_4bit: bool,
    pub load_in_8bit: bool,
}

impl QuantizationPlan {
    pub fn is_quantized(&self) -> bool {
        self.load_in_4bit || self.load_in_8bit
    }
}

/// Check that `quantization_bit` is one of 0, 4 or 8.
pub fn validate_quantization_bit(bits: i64) -> ResolveResult<()> {
    match bits {
        0 | 4 | 8 => Ok(()),
        other => Err(ResolveError::InvalidQuantization(other)),
    }
}

/// Derive the quantization flags and compute precision.
///
/// Must run after [`select_dtype`]: an `auto` compute dtype inherits the
/// resolved `cfg.dtype`. Non-zero bit widths require the `bitsandbytes`
/// package.
pub fn select_quantization(
    mut cfg: RunConfig,
    installed: &PackageVersions,
) -> ResolveResult<(RunConfig, QuantizationPlan)> {
    validate_quantization_bit(cfg.quantization_bit)?;

    if cfg.bnb_4bit_comp_dtype == DtypeRequest::Auto {
        cfg.bnb_4bit_comp_dtype = cfg.dtype;
    }
    let compute_dtype = Precision::from_request(cfg.bnb_4bit_comp_dtype).ok_or_else(|| {
        ResolveError::validation("bnb_4bit_comp_dtype", "still `auto` after dtype resolution")
    })?;

    let (load_in_4bit, load_in_8bit) = match cfg.quantization_bit {
        4 => (true, false),
        8 => (false, true),
        _ => (false, false),
    };
    if load_in_4bit || load_in_8bit {
        installed.require_all(&["bitsandbytes"])?;
    }

    Ok((cfg, QuantizationPlan { compute_dtype, load_in_4bit, load_in_8bit }))
}

/// Full-parameter training cannot be combined with quantized weights.
pub fn check_full_training(cfg: &RunConfig) -> ResolveResult<()> {
    if cfg.sft_type == SftType::Full && cfg.quantization_bit != 0 {
        return Err(ResolveError::UnsupportedCombination(format!(
            "sft_type `full` with quantization_bit {}: quantized weights can only be trained through an adapter",
            cfg.quantization_bit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;

    const GPU: HardwareCaps = HardwareCaps { bf16_supported: true };
    const OLD_GPU: HardwareCaps = HardwareCaps { bf16_supported: false };

    fn descriptor(model_type: &str) -> ModelDescriptor {
        ModelRegistry::builtin().get(model_type).unwrap().clone()
    }

    #[test]
    fn test_auto_defaults_to_bf16() {
        let mut w = Warnings::new();
        let cfg = RunConfig::with_model_type("qwen-7b-chat");
        let (cfg, sel) = select_dtype(cfg, &descriptor("qwen-7b-chat"), GPU, RunMode::Train, &mut w);
        assert_eq!(sel, DtypeSelection { torch_dtype: Precision::Bf16, fp16: false, bf16: true });
        assert_eq!(cfg.dtype, DtypeRequest::Bf16);
        assert!(w.is_empty());
    }

    #[test]
    fn test_auto_without_bf16_hardware_falls_back_to_fp16() {
        let mut w = Warnings::new();
        let cfg = RunConfig::with_model_type("qwen-7b-chat");
        let (cfg, sel) = select_dtype(cfg, &descriptor("qwen-7b-chat"), OLD_GPU, RunMode::Infer, &mut w);
        assert_eq!(sel.torch_dtype, Precision::Fp16);
        assert!(sel.fp16 && !sel.bf16);
        assert_eq!(cfg.dtype, DtypeRequest::Fp16);
    }

    #[test]
    fn test_prequantized_model_adopts_native_dtype() {
        let mut w = Warnings::new();
        let cfg = RunConfig::with_model_type("qwen-7b-chat-int4");
        let (_, sel) = select_dtype(cfg, &descriptor("qwen-7b-chat-int4"), GPU, RunMode::Infer, &mut w);
        assert_eq!(sel.torch_dtype, Precision::Fp16);
    }

    #[test]
    fn test_explicit_dtype_is_kept() {
        let mut w = Warnings::new();
        let cfg = RunConfig {
            dtype: DtypeRequest::Fp32,
            ..RunConfig::with_model_type("qwen-7b-chat-int4")
        };
        let (_, sel) = select_dtype(cfg, &descriptor("qwen-7b-chat-int4"), GPU, RunMode::Infer, &mut w);
        assert_eq!(sel, DtypeSelection { torch_dtype: Precision::Fp32, fp16: false, bf16: false });
    }

    #[test]
    fn test_fp16_full_training_upgrades_to_fp32_with_warning() {
        let mut w = Warnings::new();
        let cfg = RunConfig {
            dtype: DtypeRequest::Fp16,
            sft_type: SftType::Full,
            ..RunConfig::with_model_type("qwen-7b-chat")
        };
        let (_, sel) = select_dtype(cfg, &descriptor("qwen-7b-chat"), GPU, RunMode::Train, &mut w);
        assert_eq!(sel.torch_dtype, Precision::Fp32);
        assert!(sel.fp16);
        assert!(w.mentions("fp32"));
    }

    #[test]
    fn test_explicit_bf16_on_unsupported_hardware_only_warns() {
        let mut w = Warnings::new();
        let cfg = RunConfig {
            dtype: DtypeRequest::Bf16,
            ..RunConfig::with_model_type("qwen-7b-chat")
        };
        let (_, sel) = select_dtype(cfg, &descriptor("qwen-7b-chat"), OLD_GPU, RunMode::Train, &mut w);
        assert_eq!(sel.torch_dtype, Precision::Bf16);
        assert!(w.mentions("bf16"));
    }

    #[test]
    fn test_quantization_bits_outside_allowed_set_fail() {
        for bits in [-1, 1, 2, 3, 5, 6, 7, 9, 16, 32] {
            let cfg = RunConfig {
                quantization_bit: bits,
                dtype: DtypeRequest::Bf16,
                ..RunConfig::default()
            };
            assert!(
                matches!(
                    select_quantization(cfg, &PackageVersions::new()),
                    Err(ResolveError::InvalidQuantization(b)) if b == bits
                ),
                "bits={bits} must be rejected"
            );
        }
    }

    #[test]
    fn test_quantization_flags_are_mutually_exclusive() {
        let installed = PackageVersions::new().with("bitsandbytes", "0.41.1");
        for (bits, four, eight) in [(0, false, false), (4, true, false), (8, false, true)] {
            let cfg = RunConfig {
                quantization_bit: bits,
                dtype: DtypeRequest::Bf16,
                ..RunConfig::default()
            };
            let (cfg, plan) = select_quantization(cfg, &installed).unwrap();
            assert_eq!((plan.load_in_4bit, plan.load_in_8bit), (four, eight));
            assert_eq!(plan.compute_dtype, Precision::Bf16);
            assert_eq!(cfg.bnb_4bit_comp_dtype, DtypeRequest::Bf16);
        }
    }

    #[test]
    fn test_quantization_requires_bitsandbytes() {
        let cfg = RunConfig {
            quantization_bit: 4,
            dtype: DtypeRequest::Fp16,
            ..RunConfig::default()
        };
        assert!(matches!(
            select_quantization(cfg, &PackageVersions::new()),
            Err(ResolveError::DependencyVersion { .. })
        ));
    }

    #[test]
    fn test_full_training_rejects_quantization() {
        let cfg = RunConfig {
            sft_type: SftType::Full,
            quantization_bit: 8,
            ..RunConfig::default()
        };
        assert!(matches!(
            check_full_training(&cfg),
            Err(ResolveError::UnsupportedCombination(_))
        ));
        let cfg = RunConfig { sft_type: SftType::Full, ..RunConfig::default() };
        assert!(check_full_training(&cfg).is_ok());
    }

    #[test]
    fn test_precision_maps_to_tensor_dtype() {
        assert_eq!(Precision::Bf16.dtype(), DType::BF16);
        assert_eq!(Precision::Fp16.dtype(), DType::F16);
        assert_eq!(Precision::Fp32.dtype(), DType::F32);
    }
}
