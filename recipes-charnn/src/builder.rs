//! Model and optimizer construction.

use crate::checkpoint::Checkpoint;
use crate::model::{Gpt, GptConfig};
use candle_core::{DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use recipes_core::Result;
use recipes_core::config::OptimizerConfig;
use recipes_core::device::DeviceHandle;
use recipes_dist::{DistributedDataParallel, ProcessGroup};
use std::sync::Arc;
use tracing::info;

/// Build the data-parallel model and its optimizer.
///
/// The model is created in host memory, loaded from `checkpoint` when one is
/// given, then moved to `device`. Wrapping it broadcasts rank 0's weights to
/// the rest of the group.
pub async fn build_ddp_model_and_optimizer(
    config: &GptConfig,
    opt: &OptimizerConfig,
    checkpoint: Option<&Checkpoint>,
    device: DeviceHandle,
    group: Arc<ProcessGroup>,
) -> Result<(DistributedDataParallel<Gpt>, AdamW)> {
    let host_vars = VarMap::new();
    let host_model = Gpt::new(config, VarBuilder::from_varmap(&host_vars, DType::F32, &Device::Cpu))?;
    if let Some(checkpoint) = checkpoint {
        checkpoint.apply_to(&host_vars)?;
        info!(
            finished_epoch = checkpoint.meta.finished_epoch,
            "Model weights restored from checkpoint"
        );
    }

    let (model, varmap, target) = match device {
        DeviceHandle::Cpu => (host_model, host_vars, Device::Cpu),
        DeviceHandle::Accelerator(_) => {
            let target = device.to_candle()?;
            let varmap = move_varmap(&host_vars, &target)?;
            let model = Gpt::new(config, VarBuilder::from_varmap(&varmap, DType::F32, &target))?;
            (model, varmap, target)
        }
    };

    let device_ids = device.ordinal().map(|ordinal| vec![ordinal]);
    let ddp = DistributedDataParallel::new(model, varmap, group, device_ids, target).await?;

    let params = ParamsAdamW {
        lr: opt.lr,
        weight_decay: opt.weight_decay,
        ..Default::default()
    };
    let optimizer = AdamW::new(ddp.parameters()?, params)?;

    info!(
        parameters = parameter_count(&ddp)?,
        device = %device,
        lr = opt.lr,
        weight_decay = opt.weight_decay,
        "Model and optimizer ready"
    );
    Ok((ddp, optimizer))
}

/// Copy every variable of `varmap` onto `device` under the same name.
fn move_varmap(varmap: &VarMap, device: &Device) -> Result<VarMap> {
    let moved = VarMap::new();
    {
        let source = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter map poisoned".into()))?;
        let mut target = moved
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter map poisoned".into()))?;
        for (name, var) in source.iter() {
            let tensor = var.as_tensor().to_device(device)?;
            target.insert(name.clone(), Var::from_tensor(&tensor)?);
        }
    }
    Ok(moved)
}

fn parameter_count<M>(ddp: &DistributedDataParallel<M>) -> Result<usize> {
    Ok(ddp
        .parameters()?
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{load_checkpoint, save_checkpoint};
    use recipes_dist::Backend;
    use tempfile::TempDir;

    fn config() -> GptConfig {
        GptConfig {
            vocab_size: 6,
            block_size: 4,
            n_layer: 1,
            n_head: 2,
            n_embd: 4,
            embd_pdrop: 0.0,
            resid_pdrop: 0.0,
            attn_pdrop: 0.0,
        }
    }

    fn opt() -> OptimizerConfig {
        OptimizerConfig {
            lr: 1e-3,
            weight_decay: 0.1,
        }
    }

    fn head(ddp: &DistributedDataParallel<Gpt>) -> Vec<f32> {
        let data = ddp.varmap().data().lock().unwrap();
        data["lm_head.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[tokio::test]
    async fn test_builds_on_cpu_without_device_binding() {
        let group = Arc::new(ProcessGroup::local(Backend::Host));
        let (ddp, optimizer) =
            build_ddp_model_and_optimizer(&config(), &opt(), None, DeviceHandle::Cpu, group)
                .await
                .unwrap();
        assert!(ddp.device_ids().is_none());
        assert!(ddp.device().is_cpu());
        assert_eq!(optimizer.learning_rate(), 1e-3);
    }

    #[tokio::test]
    async fn test_checkpoint_weights_are_loaded() {
        let dir = TempDir::new().unwrap();
        let group = Arc::new(ProcessGroup::local(Backend::Host));
        let (first, _) =
            build_ddp_model_and_optimizer(&config(), &opt(), None, DeviceHandle::Cpu, group.clone())
                .await
                .unwrap();
        save_checkpoint(dir.path(), first.varmap(), 2, "job", &config()).unwrap();
        let checkpoint = load_checkpoint(Some(dir.path())).unwrap().unwrap();

        let (second, _) = build_ddp_model_and_optimizer(
            &config(),
            &opt(),
            Some(&checkpoint),
            DeviceHandle::Cpu,
            group,
        )
        .await
        .unwrap();
        assert_eq!(head(&first), head(&second));
    }
}
