//! Fused Adam and AdamW steps on top of [`MultiTensorApply`].
//!
//! Tensor lists are, in order: params, grads, exp_avgs, exp_avg_sqs and, with
//! AMSGrad, max_exp_avg_sqs. Kernels are named
//! `fused_{adam|adamw}[_amsgrad]_{param type}_{step type}`.

use serde::{Deserialize, Serialize};

use crate::{
    apply::{AdamParams, ApplyConfig, ApplyError, MultiTensorApply, DEFAULT_THREAD_GROUP_SIZE},
    context::{ComputeQueue, KernelRegistry, StorageAccessor},
    tensor::{DataType, TensorGroupSet, TensorRef},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdamVariant {
    /// L2 penalty folded into the gradient.
    Adam,
    /// Decoupled weight decay.
    AdamW,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusedAdam {
    pub variant: AdamVariant,
    pub amsgrad: bool,
    pub thread_group_size: u32,
}

impl Default for FusedAdam {
    fn default() -> Self {
        Self {
            variant: AdamVariant::Adam,
            amsgrad: false,
            thread_group_size: DEFAULT_THREAD_GROUP_SIZE,
        }
    }
}

impl FusedAdam {
    pub fn new(variant: AdamVariant, amsgrad: bool) -> Self {
        Self {
            variant,
            amsgrad,
            ..Default::default()
        }
    }

    /// Number of tensor lists the kernel reads.
    pub fn depth(&self) -> usize {
        if self.amsgrad {
            5
        } else {
            4
        }
    }

    pub fn config(&self) -> ApplyConfig {
        ApplyConfig {
            depth: self.depth(),
            thread_group_size: self.thread_group_size,
        }
    }

    pub fn kernel_name(&self, param: DataType, step: DataType) -> String {
        let variant = match self.variant {
            AdamVariant::Adam => "adam",
            AdamVariant::AdamW => "adamw",
        };
        let amsgrad = if self.amsgrad { "_amsgrad" } else { "" };
        format!(
            "fused_{variant}{amsgrad}_{}_{}",
            param.kernel_name(),
            step.kernel_name()
        )
    }

    /// A dispatcher configured for this optimizer's depth.
    pub fn dispatcher<'a, Q, K, S>(
        &self,
        queue: &'a Q,
        kernels: &'a K,
        storage: &'a S,
    ) -> MultiTensorApply<'a, Q, K, S>
    where
        Q: ComputeQueue,
        K: KernelRegistry<Program = Q::Program>,
    {
        MultiTensorApply::new(queue, kernels, storage, self.config())
    }

    /// Update every tensor group in place.
    pub fn step<Q, K, S, T>(
        &self,
        apply: &MultiTensorApply<'_, Q, K, S>,
        tensors: &TensorGroupSet<'_, T>,
        params: &AdamParams,
    ) -> Result<(), ApplyError>
    where
        Q: ComputeQueue,
        K: KernelRegistry<Program = Q::Program>,
        S: StorageAccessor<T, Buffer = Q::Buffer>,
        T: TensorRef,
    {
        params.validate()?;
        if apply.config().depth != self.depth() {
            return Err(ApplyError::Configuration(format!(
                "dispatcher depth {} does not fit a depth {} optimizer",
                apply.config().depth,
                self.depth()
            )));
        }

        let Some(first) = tensors.lists.first().and_then(|list| list.first()) else {
            return Ok(());
        };
        let param = first.dtype();
        let step = tensors
            .state_steps
            .first()
            .map(TensorRef::dtype)
            .unwrap_or(param);

        let name = self.kernel_name(param, step);
        apply.run(&name, tensors, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureQueue, HostStorage, HostTensor, KernelTable};

    #[test]
    fn test_kernel_names() {
        let adam = FusedAdam::default();
        assert_eq!(
            adam.kernel_name(DataType::F32, DataType::F32),
            "fused_adam_float_float"
        );

        let adamw = FusedAdam::new(AdamVariant::AdamW, true);
        assert_eq!(adamw.depth(), 5);
        assert_eq!(
            adamw.kernel_name(DataType::F16, DataType::F32),
            "fused_adamw_amsgrad_half_float"
        );
    }

    #[test]
    fn test_amsgrad_step_binds_five_roles() {
        let optimizer = FusedAdam::new(AdamVariant::AdamW, true);
        let mut storage = HostStorage::new();
        let lists: Vec<Vec<HostTensor>> = (0..5)
            .map(|_| vec![storage.alloc(300, DataType::F16), storage.alloc(7, DataType::F16)])
            .collect();
        let steps = vec![
            storage.alloc(1, DataType::F32),
            storage.alloc(1, DataType::F32),
        ];
        let set = TensorGroupSet::new(lists.iter().map(|list| list.as_slice()).collect(), &steps);

        let queue = CaptureQueue::new();
        let mut kernels = KernelTable::new();
        kernels.register("fused_adamw_amsgrad_half_float", 1024);
        let apply = optimizer.dispatcher(&queue, &kernels, &storage);

        let params = AdamParams {
            lr: 1.0e-2,
            weight_decay: 0.01,
            ..Default::default()
        };
        optimizer.step(&apply, &set, &params).unwrap();

        let dispatches = queue.dispatches();
        assert_eq!(dispatches.len(), 1);
        let dispatch = &dispatches[0];
        assert_eq!(dispatch.kernel, "fused_adamw_amsgrad_half_float");
        assert_eq!(dispatch.table.depth(), 5);
        assert_eq!(
            dispatch.table.get(4, 1).unwrap().buffer,
            lists[4][1].buffer
        );
        assert_eq!(dispatch.table.step(1).unwrap().buffer, steps[1].buffer);
        assert_eq!(dispatch.scalars, params.scalars());
    }

    #[test]
    fn test_invalid_params_rejected_before_dispatch() {
        let optimizer = FusedAdam::default();
        let mut storage = HostStorage::new();
        let lists: Vec<Vec<HostTensor>> = (0..4)
            .map(|_| vec![storage.alloc(10, DataType::F32)])
            .collect();
        let steps = vec![storage.alloc(1, DataType::F32)];
        let set = TensorGroupSet::new(lists.iter().map(|list| list.as_slice()).collect(), &steps);

        let queue = CaptureQueue::new();
        let mut kernels = KernelTable::new();
        kernels.register("fused_adam_float_float", 1024);
        let apply = optimizer.dispatcher(&queue, &kernels, &storage);

        let params = AdamParams {
            eps: -1.0,
            ..Default::default()
        };
        let result = optimizer.step(&apply, &set, &params);
        assert!(matches!(
            result,
            Err(ApplyError::InvalidHyperparameter { name: "eps", .. })
        ));
        assert_eq!(queue.session_count(), 0);
    }

    #[test]
    fn test_depth_mismatch_with_dispatcher() {
        let adam = FusedAdam::default();
        let amsgrad = FusedAdam::new(AdamVariant::Adam, true);
        let storage = HostStorage::new();
        let queue = CaptureQueue::new();
        let kernels = KernelTable::new();
        let apply = adam.dispatcher(&queue, &kernels, &storage);

        let steps: Vec<HostTensor> = vec![];
        let set = TensorGroupSet::new(vec![], &steps);
        let result = amsgrad.step(&apply, &set, &AdamParams::default());
        assert!(matches!(result, Err(ApplyError::Configuration(_))));
    }
}
