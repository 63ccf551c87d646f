//! Data-parallel replication wrapper.
//!
//! Wraps a module without touching its parameters. On construction rank 0's
//! weights are broadcast so every replica starts identical; after each
//! backward pass [`DistributedDataParallel::sync_gradients`] replaces every
//! gradient with its mean across the group.

use crate::group::ProcessGroup;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use recipes_core::Result;
use std::sync::Arc;
use tracing::debug;

pub struct DistributedDataParallel<M> {
    module: M,
    varmap: VarMap,
    group: Arc<ProcessGroup>,
    device_ids: Option<Vec<usize>>,
    device: Device,
}

impl<M> DistributedDataParallel<M> {
    /// Wrap `module`, whose trainable parameters are the variables of
    /// `varmap`, all resident on `device`.
    ///
    /// `device_ids` binds the replica to an accelerator; `None` for CPU.
    pub async fn new(
        module: M,
        varmap: VarMap,
        group: Arc<ProcessGroup>,
        device_ids: Option<Vec<usize>>,
        device: Device,
    ) -> Result<Self> {
        let ddp = Self {
            module,
            varmap,
            group,
            device_ids,
            device,
        };
        ddp.broadcast_parameters().await?;
        Ok(ddp)
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_ids(&self) -> Option<&[usize]> {
        self.device_ids.as_deref()
    }

    /// Trainable variables ordered by parameter name.
    ///
    /// Every rank must walk parameters in the same order for the flattened
    /// collective buffers to line up.
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter map poisoned".into()))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    pub fn parameters(&self) -> Result<Vec<Var>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .map(|(_, var)| var)
            .collect())
    }

    async fn broadcast_parameters(&self) -> Result<()> {
        if self.group.world_size() == 1 {
            return Ok(());
        }
        let vars = self.parameters()?;
        let tensors: Vec<Tensor> = vars.iter().map(|v| v.as_tensor().clone()).collect();
        let backend = self.group.backend();
        let mut flat = backend.stage_out(&tensors)?;
        self.group.broadcast_f32(&mut flat).await?;
        let synced = backend.stage_in(&flat, &tensors, &self.device)?;
        for (var, value) in vars.iter().zip(synced) {
            var.set(&value)?;
        }
        debug!(
            rank = self.group.rank(),
            values = flat.len(),
            "Parameters broadcast from rank 0"
        );
        Ok(())
    }

    /// Average gradients across the group in place.
    ///
    /// Parameters without a gradient contribute zeros so every rank sends a
    /// buffer of the same length.
    pub async fn sync_gradients(&self, grads: &mut GradStore) -> Result<()> {
        if self.group.world_size() == 1 {
            return Ok(());
        }
        let vars = self.parameters()?;
        let mut local = Vec::with_capacity(vars.len());
        for var in &vars {
            let grad = match grads.get(var.as_tensor()) {
                Some(g) => g.clone(),
                None => var.as_tensor().zeros_like()?,
            };
            local.push(grad);
        }

        let backend = self.group.backend();
        let mut flat = backend.stage_out(&local)?;
        self.group.all_reduce_mean_f32(&mut flat).await?;
        let averaged = backend.stage_in(&flat, &local, &self.device)?;
        for (var, grad) in vars.iter().zip(averaged) {
            grads.insert(var.as_tensor(), grad);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use candle_core::DType;
    use candle_nn::Init;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_single_process_wrap_keeps_parameters() {
        let varmap = VarMap::new();
        let w = varmap
            .get((2, 3), "b.weight", Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get(3, "a.bias", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();

        let group = Arc::new(ProcessGroup::local(Backend::Host));
        let ddp = DistributedDataParallel::new((), varmap, group, None, Device::Cpu)
            .await
            .unwrap();

        let names: Vec<String> = ddp
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["a.bias".to_string(), "b.weight".to_string()]);
        assert!(ddp.device_ids().is_none());

        let params = ddp.parameters().unwrap();
        let weight = params[1].as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(weight, w.to_vec2::<f32>().unwrap());
    }
}
