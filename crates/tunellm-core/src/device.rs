use candle_core::Device;
use tracing::{info, warn};

use crate::error::ResolveResult;

/// Hardware facts the precision resolver depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCaps {
    /// Whether the compute device can run bfloat16 kernels.
    pub bf16_supported: bool,
}

impl HardwareCaps {
    /// Derive capabilities from a concrete device.
    ///
    /// CPU execution is treated as lacking bf16 support, which makes an `auto`
    /// precision request fall back to fp16.
    pub fn for_device(device: &Device) -> Self {
        let bf16_supported = match device {
            Device::Cpu => false,
            Device::Cuda(_) | Device::Metal(_) => true,
        };
        Self { bf16_supported }
    }
}

/// Selects the compute device for this process.
///
/// In a multi-process launch each rank pins the accelerator matching its
/// `local_rank`. When the `cuda` feature is disabled, or the device cannot be
/// acquired, falls back to CPU.
pub fn pin_device(prefer_gpu: bool, #[allow(unused_variables)] local_rank: usize) -> ResolveResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(local_rank) {
            Ok(dev) => {
                info!(local_rank, "Pinned CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, local_rank, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(0) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!("GPU requested but this binary was built without `cuda` or `metal` support");
    }
    info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}
