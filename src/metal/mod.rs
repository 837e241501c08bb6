//! Native Metal backend for fused multi-tensor kernels on macOS.
//!
//! # Feature Flag
//!
//! Enable with `--features metal-acceleration`
//!
//! # Usage
//!
//! ```ignore
//! let ctx = Arc::new(MetalContext::with_fused_optimizers()?);
//! let queue = MetalQueue::new(ctx.clone()).wait(true);
//! let optimizer = FusedAdam::new(AdamVariant::AdamW, false);
//! let apply = optimizer.dispatcher(&queue, ctx.as_ref(), ctx.as_ref());
//! optimizer.step(&apply, &tensors, &AdamParams::default())?;
//! ```

mod context;
pub mod kernels;
mod queue;
mod tensor;

pub use context::{MetalContext, MetalProgram};
pub use queue::MetalQueue;
pub use tensor::MetalTensor;
