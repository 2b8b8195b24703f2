//! Accelerator selection.
//!
//! `auto` ranks the visible NVIDIA GPUs by name against a static preference
//! table and falls back to Metal, then CPU.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};

/// GPU name fragments in order of preference, matched case-insensitively.
pub const GPU_PRIORITY: &[&str] = &[
    "4070 super",
    "4090",
    "4080",
    "3090",
    "4070",
    "3080",
    "a100",
    "h100",
    "l40",
    "a6000",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub index: usize,
    pub name: String,
}

/// Parse `nvidia-smi --query-gpu=index,name --format=csv,noheader` output.
pub fn parse_gpu_list(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (index, name) = line.split_once(',')?;
            Some(GpuInfo {
                index: index.trim().parse().ok()?,
                name: name.trim().to_string(),
            })
        })
        .collect()
}

/// Pick a CUDA ordinal from the visible GPUs.
///
/// The first table entry that matches any GPU wins; among GPUs matching the
/// same entry the lowest index wins. With no match: ordinal 1 when more than
/// one GPU is visible, else 0. `None` when the list is empty.
pub fn rank_gpus(gpus: &[GpuInfo], priority: &[&str]) -> Option<usize> {
    if gpus.is_empty() {
        return None;
    }
    let best = gpus
        .iter()
        .filter_map(|gpu| {
            let name = gpu.name.to_lowercase();
            let rank = priority.iter().position(|p| name.contains(&p.to_lowercase()))?;
            Some((rank, gpu.index))
        })
        .min();
    Some(match best {
        Some((_, index)) => index,
        None if gpus.len() > 1 => 1,
        None => 0,
    })
}

/// Apply `CUDA_VISIBLE_DEVICES` to the physical GPU list.
///
/// The result is indexed by CUDA ordinal. Integer entries name physical
/// GPUs; the list stops at the first entry that does not resolve, as the
/// CUDA runtime does. UUID entries keep their ordinal but lose the name.
pub fn apply_visible_devices(gpus: Vec<GpuInfo>, visible: Option<&str>) -> Vec<GpuInfo> {
    let Some(visible) = visible else {
        return gpus;
    };
    let mut out = Vec::new();
    for (ordinal, entry) in visible.split(',').map(str::trim).enumerate() {
        let name = match entry.parse::<usize>() {
            Ok(physical) => match gpus.iter().find(|g| g.index == physical) {
                Some(gpu) => gpu.name.clone(),
                None => break,
            },
            Err(_) if entry.starts_with("GPU-") || entry.starts_with("MIG-") => String::new(),
            Err(_) => break,
        };
        out.push(GpuInfo { index: ordinal, name });
    }
    out
}

fn query_nvidia_smi() -> Vec<GpuInfo> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=index,name", "--format=csv,noheader"])
        .output();
    match output {
        Ok(out) if out.status.success() => parse_gpu_list(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::debug!(status = %out.status, "nvidia-smi failed");
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi not available");
            Vec::new()
        }
    }
}

/// CUDA devices this process can open, indexed by ordinal.
///
/// nvidia-smi numbers GPUs in PCI order while the CUDA runtime defaults to
/// fastest-first, so names are only trusted under `CUDA_DEVICE_ORDER=PCI_BUS_ID`
/// or with a single visible GPU.
#[cfg(feature = "cuda")]
fn enumerate_gpus() -> Vec<GpuInfo> {
    let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    let mut gpus = apply_visible_devices(query_nvidia_smi(), visible.as_deref());
    let openable = (0..16).take_while(|&i| Device::new_cuda(i).is_ok()).count();

    let pci_order = std::env::var("CUDA_DEVICE_ORDER").is_ok_and(|v| v == "PCI_BUS_ID");
    if openable > 1 && !pci_order && gpus.iter().any(|g| !g.name.is_empty()) {
        tracing::warn!("CUDA_DEVICE_ORDER is not PCI_BUS_ID; GPU names may not match CUDA ordinals");
    }
    if gpus.len() != openable {
        tracing::debug!(listed = gpus.len(), openable, "nvidia-smi and CUDA disagree on GPU count");
    }
    gpus.retain(|g| g.index < openable);
    for index in gpus.len()..openable {
        gpus.push(GpuInfo {
            index,
            name: String::new(),
        });
    }
    gpus
}

#[cfg(not(feature = "cuda"))]
fn enumerate_gpus() -> Vec<GpuInfo> {
    let listed = query_nvidia_smi();
    if !listed.is_empty() {
        tracing::warn!(gpus = listed.len(), "GPUs present but the cuda feature is not compiled in");
    }
    Vec::new()
}

/// Best available device: ranked CUDA GPU, then Metal, then CPU.
///
/// A GPU that fails to open is skipped with a warning.
pub fn auto_device() -> Result<Device> {
    let gpus = enumerate_gpus();
    if let Some(ordinal) = rank_gpus(&gpus, GPU_PRIORITY) {
        let name = gpus
            .iter()
            .find(|g| g.index == ordinal)
            .map(|g| g.name.as_str())
            .unwrap_or("unknown");
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                tracing::info!(ordinal, name, "selected CUDA device");
                return Ok(device);
            }
            Err(e) => tracing::warn!(ordinal, name, error = %e, "failed to open CUDA device, falling back"),
        }
    }
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => return Ok(device),
            Err(e) => tracing::warn!(error = %e, "Metal not available"),
        }
    }
    Ok(Device::Cpu)
}

/// Parse `auto`, `cpu`, `cuda`, `cuda:N` or `metal`.
pub fn parse_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_lowercase();
    match spec.as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        "cuda" => cuda(0),
        "metal" => metal(),
        other => match other.strip_prefix("cuda:") {
            Some(n) => cuda(n.parse().with_context(|| format!("Invalid CUDA ordinal: {n}"))?),
            None => bail!("Unknown device '{other}'. Expected auto, cpu, cuda, cuda:N or metal"),
        },
    }
}

fn cuda(ordinal: usize) -> Result<Device> {
    if !cfg!(feature = "cuda") {
        bail!("CUDA requested but this build lacks the 'cuda' feature");
    }
    Device::new_cuda(ordinal).with_context(|| format!("Failed to open cuda:{ordinal}"))
}

fn metal() -> Result<Device> {
    if !cfg!(feature = "metal") {
        bail!("Metal requested but this build lacks the 'metal' feature");
    }
    Device::new_metal(0).context("Failed to open Metal device")
}

/// Short label for logs.
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => match device.location() {
            candle_core::DeviceLocation::Cuda { gpu_id } => format!("CUDA:{gpu_id}"),
            _ => "CUDA".to_string(),
        },
        Device::Metal(_) => "Metal".to_string(),
    }
}

/// BF16 on accelerators, F32 on CPU.
pub fn compute_dtype(device: &Device) -> DType {
    if device.is_cuda() || device.is_metal() {
        DType::BF16
    } else {
        DType::F32
    }
}
