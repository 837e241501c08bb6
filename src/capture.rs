//! An in-memory backend that records dispatches instead of running them.
//!
//! Useful for checking what a call would submit without a device: tensors are
//! plain descriptors over numbered buffers, kernels are looked up in a table,
//! and every encoded dispatch is kept for inspection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    apply::{ApplyError, ArgumentTable, MetadataArguments, ScalarArgument},
    context::{
        ComputeQueue, Dispatch, EncodingSession, Kernel, KernelRegistry, ResourceUsage,
        StorageAccessor,
    },
    tensor::{BufferBinding, DataType, TensorRef},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// A tensor living at `storage_offset` elements into a host buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTensor {
    pub buffer: BufferId,
    pub storage_offset: usize,
    pub numel: usize,
    pub dtype: DataType,
}

impl TensorRef for HostTensor {
    fn numel(&self) -> usize {
        self.numel
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }
}

impl HostTensor {
    /// A view of `numel` elements starting `offset` elements into this tensor.
    pub fn view(&self, offset: usize, numel: usize) -> Self {
        Self {
            buffer: self.buffer,
            storage_offset: self.storage_offset + offset,
            numel,
            dtype: self.dtype,
        }
    }
}

/// Hands out buffer ids and resolves tensors to byte offsets.
#[derive(Debug, Default)]
pub struct HostStorage {
    next: u64,
}

impl HostStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe a fresh tensor in its own buffer.
    pub fn alloc(&mut self, numel: usize, dtype: DataType) -> HostTensor {
        let buffer = BufferId(self.next);
        self.next += 1;
        HostTensor {
            buffer,
            storage_offset: 0,
            numel,
            dtype,
        }
    }
}

impl StorageAccessor<HostTensor> for HostStorage {
    type Buffer = BufferId;

    fn buffer_handle(&self, tensor: &HostTensor) -> BufferBinding<BufferId> {
        let offset = tensor.storage_offset * tensor.dtype.size();
        BufferBinding::new(tensor.buffer, offset as u64)
    }
}

/// Kernel names with their per-work-group thread limit.
#[derive(Debug, Default, Clone)]
pub struct KernelTable {
    kernels: HashMap<String, u32>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, max_threads_per_group: u32) {
        self.kernels.insert(name.into(), max_threads_per_group);
    }
}

impl KernelRegistry for KernelTable {
    type Program = String;

    fn lookup(&self, name: &str) -> Result<Kernel<String>, ApplyError> {
        let &max_threads_per_group = self
            .kernels
            .get(name)
            .ok_or_else(|| ApplyError::KernelNotFound(name.to_string()))?;
        Ok(Kernel {
            name: name.to_string(),
            program: name.to_string(),
            max_threads_per_group,
        })
    }
}

/// A dispatch as it reached the queue.
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub kernel: String,
    pub session: usize,
    pub table: ArgumentTable<BufferId>,
    pub metadata: MetadataArguments,
    pub scalars: [ScalarArgument; 6],
    pub grid_size: u32,
    pub threads_per_group: u32,
}

#[derive(Debug, Default)]
struct CaptureInner {
    sessions: usize,
    dispatches: Vec<RecordedDispatch>,
    usages: Vec<(BufferId, ResourceUsage)>,
    fail_after: Option<usize>,
}

/// A queue that keeps every submitted dispatch.
#[derive(Debug, Default)]
pub struct CaptureQueue {
    inner: Mutex<CaptureInner>,
}

impl CaptureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every submission after the first `count`.
    pub fn fail_after(&self, count: usize) {
        self.lock().fail_after = Some(count);
    }

    fn lock(&self) -> MutexGuard<'_, CaptureInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions
    }

    pub fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.lock().dispatches.clone()
    }

    pub fn resource_usages(&self) -> Vec<(BufferId, ResourceUsage)> {
        self.lock().usages.clone()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.sessions = 0;
        inner.dispatches.clear();
        inner.usages.clear();
    }
}

struct CaptureSession<'a> {
    inner: MutexGuard<'a, CaptureInner>,
    session: usize,
}

impl EncodingSession<BufferId, String> for CaptureSession<'_> {
    fn use_resource(&mut self, buffer: &BufferId, usage: ResourceUsage) {
        self.inner.usages.push((*buffer, usage));
    }

    fn submit_dispatch(&mut self, dispatch: Dispatch<'_, BufferId, String>) -> Result<(), ApplyError> {
        if let Some(limit) = self.inner.fail_after {
            if self.inner.dispatches.len() >= limit {
                return Err(ApplyError::Submission(format!(
                    "capture queue rejects dispatches after {limit}"
                )));
            }
        }

        let Dispatch {
            kernel,
            table,
            metadata,
            scalars,
            grid_size,
            threads_per_group,
        } = dispatch;
        self.inner.dispatches.push(RecordedDispatch {
            kernel: kernel.program.clone(),
            session: self.session,
            table,
            metadata,
            scalars,
            grid_size,
            threads_per_group,
        });
        Ok(())
    }
}

impl ComputeQueue for CaptureQueue {
    type Buffer = BufferId;
    type Program = String;

    fn with_encoding_session<R, F>(&self, f: F) -> Result<R, ApplyError>
    where
        F: FnOnce(&mut dyn EncodingSession<BufferId, String>) -> Result<R, ApplyError>,
    {
        let mut inner = self.lock();
        let session = inner.sessions;
        inner.sessions += 1;

        let mut session = CaptureSession { inner, session };
        let session: &mut dyn EncodingSession<BufferId, String> = &mut session;
        f(session)
    }
}
