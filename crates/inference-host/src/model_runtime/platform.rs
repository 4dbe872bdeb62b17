//! Device and platform resolution.
//!
//! `resolve` is a pure function of the requested device, the backend kind and
//! a capability snapshot of the host. Probing the host lives behind
//! [`HostProbe`] so the decision logic can be exercised with fixed capabilities.

use super::request::{BackendKind, DeviceRequest};
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use sysinfo::System;
use tracing::{debug, info, warn};

/// Concrete device a runtime is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedDevice {
    Cpu,
    Cuda,
    /// Apple silicon; accelerator and host share memory.
    Metal,
}

impl ResolvedDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedDevice::Cpu => "cpu",
            ResolvedDevice::Cuda => "cuda",
            ResolvedDevice::Metal => "metal",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, ResolvedDevice::Cpu)
    }

    pub fn is_unified_memory(&self) -> bool {
        matches!(self, ResolvedDevice::Metal)
    }
}

impl fmt::Display for ResolvedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of what the host can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCapabilities {
    pub cuda_devices: u32,
    pub metal: bool,
    pub os: &'static str,
    pub total_memory_bytes: u64,
}

impl HostCapabilities {
    pub fn cpu_only() -> Self {
        Self {
            cuda_devices: 0,
            metal: false,
            os: std::env::consts::OS,
            total_memory_bytes: 0,
        }
    }

    pub fn has_cuda(&self) -> bool {
        self.cuda_devices > 0
    }
}

/// Outcome of device resolution plus the compatibility verdict for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResolution {
    pub device: ResolvedDevice,
    pub compatible: bool,
    pub reason: String,
}

pub fn resolve(requested: DeviceRequest, kind: BackendKind, caps: &HostCapabilities) -> DeviceResolution {
    let device = resolve_device(requested, kind, caps);
    let (compatible, reason) = check_compatibility(kind, device, caps);
    DeviceResolution { device, compatible, reason }
}

pub fn resolve_device(requested: DeviceRequest, kind: BackendKind, caps: &HostCapabilities) -> ResolvedDevice {
    let best_accelerator = if caps.has_cuda() {
        Some(ResolvedDevice::Cuda)
    } else if caps.metal && kind != BackendKind::TensorRtLlm {
        Some(ResolvedDevice::Metal)
    } else {
        None
    };

    match requested {
        DeviceRequest::Cpu => ResolvedDevice::Cpu,
        DeviceRequest::Auto => best_accelerator.unwrap_or(ResolvedDevice::Cpu),
        DeviceRequest::Accelerator => best_accelerator.unwrap_or_else(|| {
            warn!("Accelerator requested but none detected, falling back to CPU");
            ResolvedDevice::Cpu
        }),
    }
}

/// Whether `kind` can run on this host at all, with a human-readable reason.
pub fn check_compatibility(kind: BackendKind, device: ResolvedDevice, caps: &HostCapabilities) -> (bool, String) {
    match kind {
        BackendKind::TensorRtLlm => {
            if caps.os == "macos" {
                (false, "TensorRT-LLM is not supported on macOS".to_string())
            } else if !caps.has_cuda() {
                (false, "TensorRT-LLM requires an NVIDIA GPU with CUDA".to_string())
            } else if device != ResolvedDevice::Cuda {
                (false, "TensorRT-LLM cannot run on CPU".to_string())
            } else {
                (true, format!("TensorRT-LLM compatible ({} CUDA device(s))", caps.cuda_devices))
            }
        }
        BackendKind::LlamaCpp | BackendKind::Transformers => {
            (true, format!("{} compatible with {} on {}", kind, device, caps.os))
        }
        BackendKind::Auto | BackendKind::HubNative => {
            (true, format!("{} resolves to a concrete backend before loading", kind))
        }
    }
}

/// Host inspection and post-teardown memory hooks.
pub trait HostProbe: Send + Sync {
    fn capabilities(&self) -> HostCapabilities;

    /// Called after every unload, whichever cleanup path ran.
    fn release_accelerator_memory(&self, device: Option<ResolvedDevice>);
}

/// Probes the real machine. Capabilities are detected once and cached.
#[derive(Default)]
pub struct SystemProbe {
    detected: OnceLock<HostCapabilities>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn detect() -> HostCapabilities {
        let mut system = System::new();
        system.refresh_memory();

        let caps = HostCapabilities {
            cuda_devices: detect_cuda_devices(),
            metal: cfg!(all(target_os = "macos", target_arch = "aarch64")),
            os: std::env::consts::OS,
            total_memory_bytes: system.total_memory(),
        };
        info!(
            "Host capabilities: {} CUDA device(s), metal: {}, os: {}, memory: {} MB",
            caps.cuda_devices,
            caps.metal,
            caps.os,
            caps.total_memory_bytes / 1024 / 1024
        );
        caps
    }
}

impl HostProbe for SystemProbe {
    fn capabilities(&self) -> HostCapabilities {
        self.detected.get_or_init(Self::detect).clone()
    }

    fn release_accelerator_memory(&self, device: Option<ResolvedDevice>) {
        // Runtime memory pools live in the server process, which has been
        // reaped by the time this runs. Report what the host looks like now.
        if device == Some(ResolvedDevice::Cuda) {
            log_cuda_memory();
        }
        let mut system = System::new();
        system.refresh_memory();
        debug!(
            "Host memory after release: {}/{} MB available",
            system.available_memory() / 1024 / 1024,
            system.total_memory() / 1024 / 1024
        );
    }
}

#[cfg(feature = "nvml")]
fn detect_cuda_devices() -> u32 {
    use nvml_wrapper::Nvml;
    match Nvml::init().and_then(|nvml| nvml.device_count()) {
        Ok(count) => count,
        Err(e) => {
            debug!("NVML unavailable ({}), checking for nvidia-smi", e);
            detect_cuda_from_path()
        }
    }
}

#[cfg(not(feature = "nvml"))]
fn detect_cuda_devices() -> u32 {
    detect_cuda_from_path()
}

fn detect_cuda_from_path() -> u32 {
    if which::which("nvidia-smi").is_ok() {
        1
    } else {
        0
    }
}

#[cfg(feature = "nvml")]
fn log_cuda_memory() {
    use nvml_wrapper::Nvml;
    let Ok(nvml) = Nvml::init() else { return };
    if let Ok(memory) = nvml.device_by_index(0).and_then(|d| d.memory_info()) {
        info!(
            "CUDA memory after release: {} MB used of {} MB",
            memory.used / 1024 / 1024,
            memory.total / 1024 / 1024
        );
    }
}

#[cfg(not(feature = "nvml"))]
fn log_cuda_memory() {}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(cuda: u32, metal: bool, os: &'static str) -> HostCapabilities {
        HostCapabilities { cuda_devices: cuda, metal, os, total_memory_bytes: 16 << 30 }
    }

    #[test]
    fn test_cpu_request_always_cpu() {
        let d = resolve_device(DeviceRequest::Cpu, BackendKind::LlamaCpp, &caps(2, false, "linux"));
        assert_eq!(d, ResolvedDevice::Cpu);
    }

    #[test]
    fn test_auto_prefers_cuda_then_metal() {
        assert_eq!(
            resolve_device(DeviceRequest::Auto, BackendKind::LlamaCpp, &caps(1, false, "linux")),
            ResolvedDevice::Cuda
        );
        assert_eq!(
            resolve_device(DeviceRequest::Auto, BackendKind::LlamaCpp, &caps(0, true, "macos")),
            ResolvedDevice::Metal
        );
        assert_eq!(
            resolve_device(DeviceRequest::Auto, BackendKind::LlamaCpp, &caps(0, false, "linux")),
            ResolvedDevice::Cpu
        );
    }

    #[test]
    fn test_accelerator_without_hardware_falls_back() {
        let d = resolve_device(DeviceRequest::Accelerator, BackendKind::Transformers, &caps(0, false, "linux"));
        assert_eq!(d, ResolvedDevice::Cpu);
    }

    #[test]
    fn test_tensorrt_requires_cuda() {
        let res = resolve(DeviceRequest::Auto, BackendKind::TensorRtLlm, &caps(0, false, "linux"));
        assert!(!res.compatible);
        assert!(res.reason.contains("CUDA"));

        let res = resolve(DeviceRequest::Auto, BackendKind::TensorRtLlm, &caps(0, true, "macos"));
        assert!(!res.compatible);
        assert_eq!(res.device, ResolvedDevice::Cpu);

        let res = resolve(DeviceRequest::Auto, BackendKind::TensorRtLlm, &caps(1, false, "linux"));
        assert!(res.compatible);
        assert_eq!(res.device, ResolvedDevice::Cuda);
    }

    #[test]
    fn test_tensorrt_on_cpu_request_is_incompatible() {
        let res = resolve(DeviceRequest::Cpu, BackendKind::TensorRtLlm, &caps(1, false, "linux"));
        assert!(!res.compatible);
    }

    #[test]
    fn test_hub_native_is_deferred() {
        let res = resolve(DeviceRequest::Auto, BackendKind::HubNative, &caps(0, false, "linux"));
        assert!(res.compatible);
    }

    #[test]
    fn test_unified_memory_flag() {
        assert!(ResolvedDevice::Metal.is_unified_memory());
        assert!(!ResolvedDevice::Cuda.is_unified_memory());
        assert!(!ResolvedDevice::Cpu.is_accelerator());
    }
}
