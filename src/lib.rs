//! Fused multi-tensor kernels for GPU optimizers.
//!
//! An optimizer step touches every parameter of a model, each with a handful
//! of same-shaped state tensors. Launching one kernel per tensor drowns small
//! tensors in launch overhead; [`MultiTensorApply`] instead splits all of them
//! into fixed-size chunks and packs those chunks into a minimal sequence of
//! bounded dispatches, each carrying an argument table and a small metadata
//! block that maps work-groups back to `(tensor, chunk)` pairs.
//!
//! The packer only talks to the device through the traits in [`context`].
//! [`capture`] implements them in memory; the `metal` module (behind the
//! `metal-acceleration` feature on macOS) runs the fused Adam kernels.

pub mod apply;
pub mod capture;
pub mod context;
#[cfg(all(feature = "metal-acceleration", target_os = "macos"))]
pub mod metal;
pub mod optim;
pub mod profiler;
pub mod tensor;

pub use apply::{AdamParams, ApplyConfig, ApplyError, MultiTensorApply};
pub use optim::{AdamVariant, FusedAdam};
pub use tensor::{DataType, TensorGroupSet, TensorRef};
