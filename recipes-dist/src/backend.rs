//! Communication backends.
//!
//! Collectives always travel over the process-group transport as host `f32`
//! buffers. The backend decides how tensors get there: directly for CPU
//! tensors, or staged through host memory for accelerator tensors.

use candle_core::{DType, Device, Tensor};
use recipes_core::DeviceHandle;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Tensors already live in host memory.
    Host,
    /// Tensors live on the accelerator with this ordinal and are copied
    /// to host memory around every collective.
    DeviceStaged { ordinal: usize },
}

impl Backend {
    /// Backend matching the device a process selected.
    pub fn for_device(device: &DeviceHandle) -> Self {
        match device {
            DeviceHandle::Accelerator(ordinal) => Backend::DeviceStaged { ordinal: *ordinal },
            DeviceHandle::Cpu => Backend::Host,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Host => "host",
            Backend::DeviceStaged { .. } => "device-staged",
        }
    }

    /// Flatten `tensors` into one host buffer, in order.
    pub fn stage_out(&self, tensors: &[Tensor]) -> candle_core::Result<Vec<f32>> {
        let total = tensors.iter().map(|t| t.elem_count()).sum();
        let mut flat = Vec::with_capacity(total);
        for tensor in tensors {
            let host = match self {
                Backend::Host => {
                    if !tensor.device().is_cpu() {
                        candle_core::bail!("host backend given a tensor on {:?}", tensor.device());
                    }
                    tensor.flatten_all()?
                }
                Backend::DeviceStaged { .. } => tensor.flatten_all()?.to_device(&Device::Cpu)?,
            };
            flat.extend(host.to_dtype(DType::F32)?.to_vec1::<f32>()?);
        }
        Ok(flat)
    }

    /// Split a host buffer back into tensors shaped like `like`, placed on
    /// `device`.
    pub fn stage_in(
        &self,
        flat: &[f32],
        like: &[Tensor],
        device: &Device,
    ) -> candle_core::Result<Vec<Tensor>> {
        let expected: usize = like.iter().map(|t| t.elem_count()).sum();
        if expected != flat.len() {
            candle_core::bail!("staged buffer has {} values, expected {expected}", flat.len());
        }
        let mut offset = 0;
        let mut out = Vec::with_capacity(like.len());
        for tensor in like {
            let n = tensor.elem_count();
            let t = Tensor::from_slice(&flat[offset..offset + n], tensor.dims(), device)?
                .to_dtype(tensor.dtype())?;
            out.push(t);
            offset += n;
        }
        Ok(out)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Host => write!(f, "host"),
            Backend::DeviceStaged { ordinal } => write!(f, "device-staged(cuda:{ordinal})"),
        }
    }
}
