//! Tensor descriptions as seen by the dispatcher.
//!
//! The dispatcher never touches element data. It only needs each tensor's
//! element count and dtype, plus a way to turn the tensor into a device
//! buffer binding (see [`StorageAccessor`](crate::context::StorageAccessor)).

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Element types a tensor may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F16,
    BF16,
    F32,
    U32,
}

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::F16 => std::mem::size_of::<f16>(),
            DataType::BF16 => std::mem::size_of::<bf16>(),
            DataType::F32 => std::mem::size_of::<f32>(),
            DataType::U32 => std::mem::size_of::<u32>(),
        }
    }

    /// Type name used in kernel function names.
    pub fn kernel_name(&self) -> &'static str {
        match self {
            DataType::F16 => "half",
            DataType::BF16 => "bfloat",
            DataType::F32 => "float",
            DataType::U32 => "uint",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::F32 => "f32",
            DataType::U32 => "u32",
        };
        f.write_str(name)
    }
}

/// Minimal view of a tensor needed for packing.
pub trait TensorRef {
    /// Number of elements.
    fn numel(&self) -> usize;
    fn dtype(&self) -> DataType;
}

impl<T: TensorRef + ?Sized> TensorRef for &T {
    fn numel(&self) -> usize {
        (**self).numel()
    }

    fn dtype(&self) -> DataType {
        (**self).dtype()
    }
}

/// A device buffer plus the byte offset where a tensor's storage begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferBinding<B> {
    pub buffer: B,
    pub offset: u64,
}

impl<B> BufferBinding<B> {
    pub fn new(buffer: B, offset: u64) -> Self {
        Self { buffer, offset }
    }
}

/// The per-role tensor lists of one fused call, plus the step counters.
///
/// `lists[role][i]` is tensor `i` of the given role (e.g. param, grad,
/// exp_avg, exp_avg_sq); `state_steps[i]` is its step counter. All lists are
/// expected to have the same length; see
/// [`MultiTensorApply::run`](crate::apply::MultiTensorApply::run) for the checks.
#[derive(Debug, Clone)]
pub struct TensorGroupSet<'a, T> {
    pub lists: Vec<&'a [T]>,
    pub state_steps: &'a [T],
}

impl<'a, T> TensorGroupSet<'a, T> {
    pub fn new(lists: Vec<&'a [T]>, state_steps: &'a [T]) -> Self {
        Self { lists, state_steps }
    }

    /// Number of role lists.
    pub fn depth(&self) -> usize {
        self.lists.len()
    }

    /// Number of tensors per role, taken from the first list.
    pub fn len(&self) -> usize {
        self.lists.first().map(|list| list.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The tensor at `index` for every role, in role order.
    pub fn group(&self, index: usize) -> impl Iterator<Item = &'a T> + '_ {
        self.lists.iter().map(move |list| &list[index])
    }
}
