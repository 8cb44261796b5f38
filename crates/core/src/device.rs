use std::fmt;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Requested compute device for checkpoint architectures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Metal, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DevicePreference {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "cuda" | "gpu" => Self::Cuda,
            "metal" | "mps" => Self::Metal,
            _ => Self::Auto,
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        };
        f.write_str(name)
    }
}

/// Resolves a preference to a usable device. Unavailable accelerators fall
/// back to the CPU with a warning instead of failing the run.
pub fn select_device(preference: DevicePreference) -> Device {
    let selected = match preference {
        DevicePreference::Cpu => None,
        DevicePreference::Cuda => {
            let device = try_cuda();
            if device.is_none() {
                warn!("CUDA device requested but unavailable; using CPU");
            }
            device
        }
        DevicePreference::Metal => {
            let device = try_metal();
            if device.is_none() {
                warn!("Metal device requested but unavailable; using CPU");
            }
            device
        }
        DevicePreference::Auto => try_metal().or_else(try_cuda),
    };

    let device = selected.unwrap_or(Device::Cpu);
    info!(requested = %preference, device = device_label(&device), "Compute device selected");
    device
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

fn try_cuda() -> Option<Device> {
    if !candle_core::utils::cuda_is_available() {
        return None;
    }
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(error) => {
            debug!(%error, "CUDA device initialization failed");
            None
        }
    }
}

fn try_metal() -> Option<Device> {
    if !candle_core::utils::metal_is_available() {
        return None;
    }
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(error) => {
            debug!(%error, "Metal device initialization failed");
            None
        }
    }
}
