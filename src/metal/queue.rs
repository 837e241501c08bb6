//! Command submission for fused multi-tensor kernels.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metal::{Buffer, CommandBuffer, ComputeCommandEncoder, MTLResourceOptions, MTLResourceUsage, MTLSize};

use super::{MetalContext, MetalProgram};
use crate::{
    apply::ApplyError,
    context::{ComputeQueue, Dispatch, EncodingSession, ResourceUsage},
};

/// Encodes every dispatch of one call into a single command buffer.
///
/// Calls from several threads are serialized on an internal lock; each call
/// commits its own command buffer when it returns. Buffers referenced through
/// the argument table are not retained by Metal, so callers must keep their
/// tensors alive until the work completes (or enable [`MetalQueue::wait`]).
pub struct MetalQueue {
    ctx: Arc<MetalContext>,
    encoding: Mutex<()>,
    wait: bool,
}

impl MetalQueue {
    pub fn new(ctx: Arc<MetalContext>) -> Self {
        Self {
            ctx,
            encoding: Mutex::new(()),
            wait: false,
        }
    }

    /// Block until the command buffer completes after each call.
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn context(&self) -> &Arc<MetalContext> {
        &self.ctx
    }
}

impl std::fmt::Debug for MetalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalQueue").field("wait", &self.wait).finish()
    }
}

struct MetalSession<'a> {
    _guard: MutexGuard<'a, ()>,
    ctx: &'a MetalContext,
    encoder: ComputeCommandEncoder,
}

impl MetalSession<'_> {
    fn argument_buffer(
        &self,
        dispatch: &Dispatch<'_, Buffer, MetalProgram>,
    ) -> Buffer {
        let encoder = dispatch.kernel.program.function.new_argument_encoder(0);
        let buffer = self
            .ctx
            .new_buffer(encoder.encoded_length(), MTLResourceOptions::StorageModeShared);
        encoder.set_argument_buffer(&buffer, 0);
        for (index, binding) in dispatch.table.bindings() {
            encoder.set_buffer(index as u64, &binding.buffer, binding.offset);
        }
        buffer
    }
}

impl EncodingSession<Buffer, MetalProgram> for MetalSession<'_> {
    fn use_resource(&mut self, buffer: &Buffer, usage: ResourceUsage) {
        let usage = match usage {
            ResourceUsage::Read => MTLResourceUsage::Read,
            ResourceUsage::ReadWrite => MTLResourceUsage::Read | MTLResourceUsage::Write,
        };
        self.encoder.use_resource(buffer, usage);
    }

    fn submit_dispatch(
        &mut self,
        dispatch: Dispatch<'_, Buffer, MetalProgram>,
    ) -> Result<(), ApplyError> {
        if dispatch.grid_size == 0 || dispatch.threads_per_group == 0 {
            return Err(ApplyError::Submission(format!(
                "empty launch for {}: {} groups of {} threads",
                dispatch.kernel.name, dispatch.grid_size, dispatch.threads_per_group
            )));
        }

        let arguments = self.argument_buffer(&dispatch);
        let encoder = &self.encoder;
        encoder.set_compute_pipeline_state(&dispatch.kernel.program.pipeline);
        encoder.set_buffer(0, Some(&arguments), 0);

        let metadata = dispatch.metadata.as_bytes();
        encoder.set_bytes(1, metadata.len() as u64, metadata.as_ptr() as *const _);
        for (index, scalar) in dispatch.scalars.iter().enumerate() {
            let bytes = scalar.as_bytes();
            encoder.set_bytes(
                2 + index as u64,
                bytes.len() as u64,
                bytes.as_ptr() as *const _,
            );
        }

        encoder.dispatch_thread_groups(
            MTLSize::new(dispatch.grid_size as u64, 1, 1),
            MTLSize::new(dispatch.threads_per_group as u64, 1, 1),
        );
        Ok(())
    }
}

impl ComputeQueue for MetalQueue {
    type Buffer = Buffer;
    type Program = MetalProgram;

    fn with_encoding_session<R, F>(&self, f: F) -> Result<R, ApplyError>
    where
        F: FnOnce(&mut dyn EncodingSession<Buffer, MetalProgram>) -> Result<R, ApplyError>,
    {
        let guard = self.encoding.lock().unwrap_or_else(PoisonError::into_inner);
        let command_buffer: CommandBuffer = self.ctx.queue().new_command_buffer().to_owned();
        let encoder = command_buffer.new_compute_command_encoder().to_owned();

        let mut session = MetalSession {
            _guard: guard,
            ctx: &self.ctx,
            encoder,
        };
        let result = {
            let session: &mut dyn EncodingSession<Buffer, MetalProgram> = &mut session;
            f(session)
        };

        // Whatever was encoded before an error still runs.
        session.encoder.end_encoding();
        command_buffer.commit();
        if self.wait {
            command_buffer.wait_until_completed();
        }
        result
    }
}
