//! Device selection.
//!
//! A process picks its compute device once and threads the resulting
//! [`DeviceHandle`] through model construction, data loading and the
//! communication backend.

use candle_core::Device;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};

/// Which physical compute unit this process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceHandle {
    /// CUDA device with the given ordinal.
    Accelerator(usize),
    Cpu,
}

impl DeviceHandle {
    /// Select the accelerator at `local_rank` if CUDA is usable, CPU otherwise.
    pub fn select(local_rank: usize) -> Self {
        Self::select_with(candle_core::utils::cuda_is_available(), local_rank)
    }

    /// Selection rule with the accelerator check supplied by the caller.
    pub fn select_with(accelerator_available: bool, local_rank: usize) -> Self {
        if accelerator_available {
            DeviceHandle::Accelerator(local_rank)
        } else {
            DeviceHandle::Cpu
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, DeviceHandle::Accelerator(_))
    }

    pub fn ordinal(&self) -> Option<usize> {
        match self {
            DeviceHandle::Accelerator(ordinal) => Some(*ordinal),
            DeviceHandle::Cpu => None,
        }
    }

    /// Resolve to a candle device.
    ///
    /// Accelerator devices are created once per ordinal and reused, so every
    /// tensor the process allocates on a given ordinal shares one context.
    pub fn to_candle(&self) -> candle_core::Result<Device> {
        match self {
            DeviceHandle::Cpu => Ok(Device::Cpu),
            DeviceHandle::Accelerator(ordinal) => {
                static DEVICES: OnceLock<Mutex<HashMap<usize, Device>>> = OnceLock::new();
                let devices = DEVICES.get_or_init(|| Mutex::new(HashMap::new()));
                let mut devices = devices
                    .lock()
                    .map_err(|_| candle_core::Error::Msg("device cache poisoned".into()))?;
                if let Some(device) = devices.get(ordinal) {
                    return Ok(device.clone());
                }
                let device = Device::new_cuda(*ordinal)?;
                devices.insert(*ordinal, device.clone());
                Ok(device)
            }
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceHandle::Accelerator(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceHandle::Cpu => write!(f, "cpu"),
        }
    }
}
