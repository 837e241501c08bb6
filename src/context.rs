//! The device-side collaborators of a fused multi-tensor call.
//!
//! The packing algorithm is written against these traits only, so it runs the
//! same way on the Metal backend (`metal` module) and on the in-memory
//! [`capture`](crate::capture) backend used for dry runs and tests.

use crate::{
    apply::{ApplyError, ArgumentTable, MetadataArguments, ScalarArgument},
    tensor::BufferBinding,
};

/// A compiled compute program resolved by name.
#[derive(Debug, Clone)]
pub struct Kernel<P> {
    pub name: String,
    pub program: P,
    /// Upper bound on threads per work-group reported by the compiled program.
    pub max_threads_per_group: u32,
}

/// Resolves compiled programs by function name.
pub trait KernelRegistry {
    type Program;

    /// Fails with [`ApplyError::KernelNotFound`] if `name` is not registered.
    fn lookup(&self, name: &str) -> Result<Kernel<Self::Program>, ApplyError>;
}

/// How a dispatch touches a buffer, for the queue's hazard tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    Read,
    ReadWrite,
}

/// Everything one dispatch binds and launches.
///
/// Bind order: argument table at index 0, metadata at 1, scalars from 2 on.
#[derive(Debug, Clone)]
pub struct Dispatch<'a, B, P> {
    pub kernel: &'a Kernel<P>,
    pub table: ArgumentTable<B>,
    pub metadata: MetadataArguments,
    pub scalars: [ScalarArgument; 6],
    /// Number of work-groups launched.
    pub grid_size: u32,
    pub threads_per_group: u32,
}

/// Exclusive access to the compute encoder for the duration of one batch.
pub trait EncodingSession<B, P> {
    fn use_resource(&mut self, buffer: &B, usage: ResourceUsage);

    /// Encode one dispatch. Dispatches are encoded in call order.
    fn submit_dispatch(&mut self, dispatch: Dispatch<'_, B, P>) -> Result<(), ApplyError>;
}

/// A compute command stream.
pub trait ComputeQueue {
    type Buffer;
    type Program;

    /// Run `f` with exclusive access to the encoder. The session is released
    /// when `f` returns, on success and on error alike.
    fn with_encoding_session<R, F>(&self, f: F) -> Result<R, ApplyError>
    where
        F: FnOnce(&mut dyn EncodingSession<Self::Buffer, Self::Program>) -> Result<R, ApplyError>;
}

/// Maps a tensor handle to the device buffer and byte offset backing it.
pub trait StorageAccessor<T: ?Sized> {
    type Buffer;

    fn buffer_handle(&self, tensor: &T) -> BufferBinding<Self::Buffer>;
}
