//! Batched dispatch of one element-wise kernel over many tensors.
//!
//! Each tensor is split into chunks of [`CHUNK_SIZE`] elements and every chunk
//! is handed to exactly one work-group. Chunks of consecutive tensors are
//! packed into as few dispatches as the two hardware limits allow:
//! at most [`MAX_TENSORS_PER_DISPATCH`] tensors in one argument table and at
//! most [`MAX_THREADGROUPS`] work-groups per dispatch.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    context::{
        ComputeQueue, Dispatch, EncodingSession, Kernel, KernelRegistry, ResourceUsage,
        StorageAccessor,
    },
    profiler::{KernelProfiler, NoopProfiler},
    tensor::{DataType, TensorGroupSet, TensorRef},
};

mod metadata;
mod packer;
mod table;

pub use metadata::{AdamParams, MetadataArguments, ScalarArgument};
pub use packer::{chunk_count, PackedDispatch, Packer, PackingCursor};
pub use table::ArgumentTable;

/// Elements processed by one work-group.
pub const CHUNK_SIZE: usize = 65536;
/// Work-groups launched by one dispatch.
pub const MAX_THREADGROUPS: usize = 32;
/// Tensors described by one argument table.
pub const MAX_TENSORS_PER_DISPATCH: usize = 32;
/// Upper bound for data bound by value (Metal `setBytes` limit).
pub const MAX_METADATA_BYTES: usize = 4096;
pub const DEFAULT_THREAD_GROUP_SIZE: u32 = 512;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid tensor lists: {0}")]
    Configuration(String),
    #[error("only f32 and f16 are supported, tensor list {role} holds {dtype}")]
    UnsupportedDtype { role: usize, dtype: DataType },
    #[error("cannot split a tensor of {numel} elements into chunks")]
    ChunkCount { numel: usize },
    #[error("kernel `{0}` not found")]
    KernelNotFound(String),
    #[error("invalid hyperparameter {name}: {value}")]
    InvalidHyperparameter { name: &'static str, value: f64 },
    #[error("dispatch submission failed: {0}")]
    Submission(String),
}

/// Static shape of a fused call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Number of tensor lists the kernel expects, not counting step counters.
    pub depth: usize,
    /// Requested threads per work-group, clamped to the kernel's limit.
    pub thread_group_size: u32,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            thread_group_size: DEFAULT_THREAD_GROUP_SIZE,
        }
    }
}

/// Packs and submits fused multi-tensor kernel calls.
pub struct MultiTensorApply<'a, Q, K, S> {
    queue: &'a Q,
    kernels: &'a K,
    storage: &'a S,
    profiler: &'a dyn KernelProfiler,
    config: ApplyConfig,
}

impl<'a, Q, K, S> MultiTensorApply<'a, Q, K, S>
where
    Q: ComputeQueue,
    K: KernelRegistry<Program = Q::Program>,
{
    pub fn new(queue: &'a Q, kernels: &'a K, storage: &'a S, config: ApplyConfig) -> Self {
        Self {
            queue,
            kernels,
            storage,
            profiler: &NoopProfiler,
            config,
        }
    }

    pub fn with_profiler(mut self, profiler: &'a dyn KernelProfiler) -> Self {
        self.profiler = profiler;
        self
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    /// Checks done once, before any work is issued.
    pub fn validate<T: TensorRef>(&self, tensors: &TensorGroupSet<'_, T>) -> Result<(), ApplyError> {
        if tensors.depth() != self.config.depth {
            return Err(ApplyError::Configuration(format!(
                "number of tensor lists ({}) has to match the depth ({})",
                tensors.depth(),
                self.config.depth
            )));
        }

        let lengths = tensors
            .lists
            .iter()
            .map(|list| list.len())
            .chain(std::iter::once(tensors.state_steps.len()));
        if !lengths.clone().all_equal() {
            return Err(ApplyError::Configuration(format!(
                "tensor lists and state steps differ in length: {:?}",
                lengths.collect_vec()
            )));
        }

        for (role, list) in tensors.lists.iter().enumerate() {
            if let Some(first) = list.first() {
                match first.dtype() {
                    DataType::F32 | DataType::F16 => {}
                    dtype => return Err(ApplyError::UnsupportedDtype { role, dtype }),
                }
            }
        }
        Ok(())
    }

    /// Compute the dispatch sequence `run` would submit, without a device.
    pub fn plan<T: TensorRef>(
        &self,
        tensors: &TensorGroupSet<'_, T>,
    ) -> Result<Vec<PackedDispatch>, ApplyError> {
        if tensors.is_empty() {
            return Ok(vec![]);
        }
        self.validate(tensors)?;

        let numels = tensors.lists[0].iter().map(TensorRef::numel).collect_vec();
        Packer::new(&numels).collect()
    }

    /// Run `kernel_name` over every element of every tensor in `tensors`.
    ///
    /// Returns immediately, without touching the queue, if there are no
    /// tensors. Otherwise all dispatches are encoded within one encoding
    /// session, in packing order. On error, dispatches already submitted stay
    /// submitted.
    pub fn run<T>(
        &self,
        kernel_name: &str,
        tensors: &TensorGroupSet<'_, T>,
        params: &AdamParams,
    ) -> Result<(), ApplyError>
    where
        T: TensorRef,
        S: StorageAccessor<T, Buffer = Q::Buffer>,
    {
        if tensors.is_empty() {
            return Ok(());
        }
        self.validate(tensors)?;

        let kernel = self.kernels.lookup(kernel_name)?;
        let threads_per_group = kernel.max_threads_per_group.min(self.config.thread_group_size);
        if threads_per_group < self.config.thread_group_size {
            log::debug!(
                "{kernel_name}: thread group size clamped from {} to {threads_per_group}",
                self.config.thread_group_size
            );
        }

        let numels = tensors.lists[0].iter().map(TensorRef::numel).collect_vec();
        let scalars = params.scalars();

        self.queue.with_encoding_session(|session| {
            self.profiler.begin_kernel(kernel_name, tensors.len());
            let result = self.encode(session, &kernel, tensors, &numels, scalars, threads_per_group);
            self.profiler.end_kernel(kernel_name);

            let count = result?;
            log::debug!(
                "{kernel_name}: {} tensors, {} elements in {count} dispatches",
                tensors.len(),
                numels.iter().sum::<usize>()
            );
            Ok(())
        })
    }

    fn encode<T>(
        &self,
        session: &mut dyn EncodingSession<Q::Buffer, Q::Program>,
        kernel: &Kernel<Q::Program>,
        tensors: &TensorGroupSet<'_, T>,
        numels: &[usize],
        scalars: [ScalarArgument; 6],
        threads_per_group: u32,
    ) -> Result<usize, ApplyError>
    where
        S: StorageAccessor<T, Buffer = Q::Buffer>,
    {
        let mut count = 0;
        for packed in Packer::new(numels) {
            let packed = packed?;
            let table = self.bind(session, tensors, &packed);

            log::debug!(
                "{}: dispatch {count}: {} slots, {} work-groups{}",
                kernel.name,
                packed.slots().len(),
                packed.threadgroups,
                if packed.continued { ", continues slot 0" } else { "" }
            );

            session.submit_dispatch(Dispatch {
                kernel,
                table,
                metadata: packed.metadata,
                scalars,
                grid_size: packed.threadgroups as u32,
                threads_per_group,
            })?;
            count += 1;
        }
        Ok(count)
    }

    /// Build a fresh argument table for one packed dispatch.
    fn bind<T>(
        &self,
        session: &mut dyn EncodingSession<Q::Buffer, Q::Program>,
        tensors: &TensorGroupSet<'_, T>,
        packed: &PackedDispatch,
    ) -> ArgumentTable<Q::Buffer>
    where
        S: StorageAccessor<T, Buffer = Q::Buffer>,
    {
        let mut table = ArgumentTable::new(tensors.depth());
        for (slot, &index) in packed.slots().iter().enumerate() {
            for (role, tensor) in tensors.group(index).enumerate() {
                let binding = self.storage.buffer_handle(tensor);
                session.use_resource(&binding.buffer, ResourceUsage::ReadWrite);
                table.set(role, slot, binding);
            }

            let binding = self.storage.buffer_handle(&tensors.state_steps[index]);
            session.use_resource(&binding.buffer, ResourceUsage::Read);
            table.set_step(slot, binding);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureQueue, HostStorage, HostTensor, KernelTable};
    use crate::profiler::KernelTimer;

    const KERNEL: &str = "fused_adam_float_float";

    struct Fixture {
        storage: HostStorage,
        lists: Vec<Vec<HostTensor>>,
        steps: Vec<HostTensor>,
    }

    impl Fixture {
        fn new(depth: usize, numels: &[usize], dtype: DataType) -> Self {
            // Only the first test to get here installs the logger.
            let _ = simple_logger::SimpleLogger::new()
                .with_level(log::LevelFilter::Warn)
                .with_module_level("multi_tensor_apply", log::LevelFilter::Debug)
                .init();

            let mut storage = HostStorage::new();
            let lists = (0..depth)
                .map(|_| numels.iter().map(|&n| storage.alloc(n, dtype)).collect())
                .collect();
            let steps = numels.iter().map(|_| storage.alloc(1, DataType::F32)).collect();
            Self {
                storage,
                lists,
                steps,
            }
        }

        fn set(&self) -> TensorGroupSet<'_, HostTensor> {
            TensorGroupSet::new(
                self.lists.iter().map(|list| list.as_slice()).collect(),
                &self.steps,
            )
        }
    }

    fn kernels() -> KernelTable {
        let mut kernels = KernelTable::new();
        kernels.register(KERNEL, 1024);
        kernels
    }

    #[test]
    fn test_single_tensor_dispatch() {
        let fixture = Fixture::new(4, &[10], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();

        assert_eq!(queue.session_count(), 1);
        let dispatches = queue.dispatches();
        assert_eq!(dispatches.len(), 1);

        let dispatch = &dispatches[0];
        assert_eq!(dispatch.kernel, KERNEL);
        assert_eq!(dispatch.grid_size, 1);
        assert_eq!(dispatch.threads_per_group, 512);
        assert_eq!(dispatch.metadata.numels[0], 10);
        assert_eq!(dispatch.table.slot_count(), 1);
        for role in 0..4 {
            let binding = dispatch.table.get(role, 0).unwrap();
            assert_eq!(binding.buffer, fixture.lists[role][0].buffer);
        }
        assert_eq!(
            dispatch.table.step(0).unwrap().buffer,
            fixture.steps[0].buffer
        );
    }

    #[test]
    fn test_forty_tiny_tensors() {
        let fixture = Fixture::new(4, &[1; 40], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();

        let dispatches = queue.dispatches();
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].grid_size, 32);
        assert_eq!(dispatches[0].table.slot_count(), 32);
        assert_eq!(dispatches[1].grid_size, 8);
        assert_eq!(dispatches[1].table.slot_count(), 8);
        assert_eq!(
            dispatches[1].table.get(2, 0).unwrap().buffer,
            fixture.lists[2][32].buffer
        );
    }

    #[test]
    fn test_split_tensor_rebinds_slot_zero() {
        let fixture = Fixture::new(4, &[40 * CHUNK_SIZE], DataType::F16);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();

        let dispatches = queue.dispatches();
        assert_eq!(dispatches.len(), 2);
        for dispatch in &dispatches {
            assert_eq!(dispatch.table.slot_count(), 1);
            assert_eq!(dispatch.metadata.numels[0] as usize, 40 * CHUNK_SIZE);
            assert_eq!(
                dispatch.table.get(0, 0).unwrap().buffer,
                fixture.lists[0][0].buffer
            );
        }
        assert_eq!(dispatches[0].grid_size, 32);
        assert_eq!(dispatches[1].grid_size, 8);
        assert_eq!(dispatches[1].metadata.threadgroup_to_chunk[0], 32);
    }

    #[test]
    fn test_resources_marked_per_role() {
        let fixture = Fixture::new(4, &[3, 0, 5], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();

        let usages = queue.resource_usages();
        let writes = usages
            .iter()
            .filter(|(_, usage)| *usage == ResourceUsage::ReadWrite)
            .count();
        let reads = usages
            .iter()
            .filter(|(_, usage)| *usage == ResourceUsage::Read)
            .count();
        assert_eq!(writes, 2 * 4);
        assert_eq!(reads, 2);
        assert!(!usages
            .iter()
            .any(|(buffer, _)| *buffer == fixture.lists[0][1].buffer));
    }

    #[test]
    fn test_empty_input_skips_session() {
        let fixture = Fixture::new(4, &[], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = KernelTable::new();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        // The kernel is not even looked up.
        apply
            .run("missing", &fixture.set(), &AdamParams::default())
            .unwrap();
        assert_eq!(queue.session_count(), 0);
        assert!(queue.dispatches().is_empty());
    }

    #[test]
    fn test_depth_mismatch() {
        let fixture = Fixture::new(3, &[10], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        let result = apply.run(KERNEL, &fixture.set(), &AdamParams::default());
        assert!(matches!(result, Err(ApplyError::Configuration(_))));
        assert_eq!(queue.session_count(), 0);
    }

    #[test]
    fn test_length_mismatch() {
        let fixture = Fixture::new(4, &[10, 20], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        let set = TensorGroupSet::new(
            fixture.lists.iter().map(|list| list.as_slice()).collect(),
            &fixture.steps[..1],
        );
        let result = apply.run(KERNEL, &set, &AdamParams::default());
        assert!(matches!(result, Err(ApplyError::Configuration(_))));
    }

    #[test]
    fn test_unsupported_dtype() {
        let fixture = Fixture::new(4, &[10], DataType::BF16);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        let result = apply.run(KERNEL, &fixture.set(), &AdamParams::default());
        assert!(matches!(
            result,
            Err(ApplyError::UnsupportedDtype {
                role: 0,
                dtype: DataType::BF16
            })
        ));
        assert!(queue.dispatches().is_empty());
    }

    #[test]
    fn test_unknown_kernel() {
        let fixture = Fixture::new(4, &[10], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        let result = apply.run("fused_sgd_float_float", &fixture.set(), &AdamParams::default());
        assert!(matches!(result, Err(ApplyError::KernelNotFound(name)) if name == "fused_sgd_float_float"));
        assert_eq!(queue.session_count(), 0);
    }

    #[test]
    fn test_thread_group_clamped_to_kernel_limit() {
        let fixture = Fixture::new(4, &[10], DataType::F32);
        let queue = CaptureQueue::new();
        let mut kernels = KernelTable::new();
        kernels.register(KERNEL, 256);
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();
        assert_eq!(queue.dispatches()[0].threads_per_group, 256);
    }

    #[test]
    fn test_run_matches_plan() {
        let numels: Vec<usize> = (0..50).map(|i| (i % 4) * 3 * CHUNK_SIZE / 2).collect();
        let fixture = Fixture::new(4, &numels, DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default());

        let plan = apply.plan(&fixture.set()).unwrap();
        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();
        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();

        let dispatches = queue.dispatches();
        assert_eq!(dispatches.len(), 2 * plan.len());
        for (packed, dispatch) in plan.iter().cycle().zip(&dispatches) {
            assert_eq!(packed.metadata, dispatch.metadata);
            assert_eq!(packed.threadgroups as u32, dispatch.grid_size);
            for (slot, &index) in packed.slots().iter().enumerate() {
                assert_eq!(
                    dispatch.table.get(1, slot).unwrap().buffer,
                    fixture.lists[1][index].buffer
                );
            }
        }
    }

    #[test]
    fn test_profiler_sees_one_kernel() {
        let fixture = Fixture::new(4, &[1; 70], DataType::F32);
        let queue = CaptureQueue::new();
        let kernels = kernels();
        let timer = KernelTimer::new();
        let apply = MultiTensorApply::new(&queue, &kernels, &fixture.storage, ApplyConfig::default())
            .with_profiler(&timer);

        apply
            .run(KERNEL, &fixture.set(), &AdamParams::default())
            .unwrap();

        let results = timer.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, KERNEL);
        assert_eq!(results[0].tensors, 70);
        assert_eq!(queue.dispatches().len(), 3);
    }
}
