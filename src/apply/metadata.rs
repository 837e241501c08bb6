//! Constant-buffer records bound next to the argument table.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use super::{ApplyError, MAX_METADATA_BYTES, MAX_TENSORS_PER_DISPATCH, MAX_THREADGROUPS};

/// Per-dispatch work description read by the kernel.
///
/// Work-group `g` processes chunk `threadgroup_to_chunk[g]` of the tensor in
/// slot `threadgroup_to_tensor[g]`; `numels[slot]` lets it clamp the final,
/// possibly partial, chunk. Unused entries are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MetadataArguments {
    pub numels: [u32; MAX_TENSORS_PER_DISPATCH],
    pub threadgroup_to_tensor: [u32; MAX_THREADGROUPS],
    pub threadgroup_to_chunk: [u32; MAX_THREADGROUPS],
}

// Bound with `set_bytes`, which only accepts small constant data.
const _: () = assert!(std::mem::size_of::<MetadataArguments>() <= MAX_METADATA_BYTES);

impl Default for MetadataArguments {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl MetadataArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// The first `count` `(slot, chunk)` work-group assignments.
    pub fn threadgroups(&self, count: usize) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.threadgroup_to_tensor
            .iter()
            .copied()
            .zip(self.threadgroup_to_chunk.iter().copied())
            .take(count)
    }
}

/// A scalar kernel argument, bound by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArgument {
    F32(f32),
    U8(u8),
}

impl ScalarArgument {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ScalarArgument::F32(value) => bytemuck::bytes_of(value),
            ScalarArgument::U8(value) => std::slice::from_ref(value),
        }
    }
}

/// Adam-family hyperparameters shared by every tensor of a call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub eps: f64,
    pub maximize: bool,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1.0e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1.0e-8,
            maximize: false,
        }
    }
}

impl AdamParams {
    /// Scalars in binding order: lr, beta1, beta2, weight_decay, eps, maximize.
    pub fn scalars(&self) -> [ScalarArgument; 6] {
        [
            ScalarArgument::F32(self.lr as f32),
            ScalarArgument::F32(self.beta1 as f32),
            ScalarArgument::F32(self.beta2 as f32),
            ScalarArgument::F32(self.weight_decay as f32),
            ScalarArgument::F32(self.eps as f32),
            ScalarArgument::U8(self.maximize as u8),
        ]
    }

    pub fn validate(&self) -> Result<(), ApplyError> {
        let check = |name: &'static str, value: f64, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ApplyError::InvalidHyperparameter { name, value })
            }
        };
        check("lr", self.lr, self.lr >= 0.0)?;
        check("eps", self.eps, self.eps >= 0.0)?;
        check("beta1", self.beta1, (0.0..1.0).contains(&self.beta1))?;
        check("beta2", self.beta2, (0.0..1.0).contains(&self.beta2))?;
        check("weight_decay", self.weight_decay, self.weight_decay >= 0.0)?;
        Ok(())
    }
}
