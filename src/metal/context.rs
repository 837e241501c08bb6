//! Metal context for managing device, command queue, and pipeline cache.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use metal::{
    Buffer as MetalBuffer, CommandQueue, CompileOptions, ComputePipelineState, Device, Function,
    Library, MTLResourceOptions,
};

use super::MetalTensor;
use crate::{
    apply::ApplyError,
    context::{Kernel, KernelRegistry, StorageAccessor},
    tensor::{BufferBinding, DataType},
};

/// A compiled kernel: the pipeline to run and the function its argument
/// encoder is built from.
#[derive(Clone)]
pub struct MetalProgram {
    pub pipeline: ComputePipelineState,
    pub function: Function,
}

impl std::fmt::Debug for MetalProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalProgram")
            .field("function", &self.function.name())
            .field(
                "max_threads",
                &self.pipeline.max_total_threads_per_threadgroup(),
            )
            .finish()
    }
}

/// Metal context holding device, queue, and cached pipelines.
pub struct MetalContext {
    device: Device,
    queue: CommandQueue,
    library: Option<Library>,
    pipelines: Mutex<HashMap<String, MetalProgram>>,
}

impl MetalContext {
    /// Create a new Metal context using the system default device.
    pub fn new() -> Result<Self, ApplyError> {
        let device = Device::system_default()
            .ok_or_else(|| ApplyError::Submission("no Metal device available".into()))?;
        let queue = device.new_command_queue();

        Ok(Self {
            device,
            queue,
            library: None,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Create a context and compile the fused optimizer kernels.
    pub fn with_fused_optimizers() -> Result<Self, ApplyError> {
        let mut context = Self::new()?;
        context.compile_library(super::kernels::FUSED_ADAM_SOURCE)?;
        Ok(context)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Compile Metal shader source and cache the library.
    ///
    /// Pipelines compiled from a previous library are dropped.
    pub fn compile_library(&mut self, source: &str) -> Result<(), ApplyError> {
        let options = CompileOptions::new();
        let library = self
            .device
            .new_library_with_source(source, &options)
            .map_err(|err| {
                log::error!("Metal shader compilation error: {err}");
                ApplyError::Submission(err)
            })?;
        self.library = Some(library);
        self.pipelines
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn load_program(&self, name: &str) -> Result<MetalProgram, ApplyError> {
        let not_found = || ApplyError::KernelNotFound(name.to_string());
        let library = self.library.as_ref().ok_or_else(not_found)?;
        let function = library.get_function(name, None).map_err(|_| not_found())?;
        let pipeline = self
            .device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(ApplyError::Submission)?;
        Ok(MetalProgram { pipeline, function })
    }

    /// Upload `data` into a new shared buffer.
    pub fn new_tensor<T: bytemuck::Pod>(&self, data: &[T], dtype: DataType) -> MetalTensor {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = self.device.new_buffer_with_data(
            bytes.as_ptr() as *const _,
            bytes.len() as u64,
            MTLResourceOptions::StorageModeShared,
        );
        MetalTensor::new(buffer, bytes.len() / dtype.size(), dtype)
    }

    pub fn new_buffer(&self, size: u64, options: MTLResourceOptions) -> MetalBuffer {
        self.device.new_buffer(size, options)
    }
}

impl KernelRegistry for MetalContext {
    type Program = MetalProgram;

    fn lookup(&self, name: &str) -> Result<Kernel<MetalProgram>, ApplyError> {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        let program = match pipelines.get(name) {
            Some(program) => program.clone(),
            None => {
                let program = self.load_program(name)?;
                pipelines.insert(name.to_string(), program.clone());
                program
            }
        };

        let max_threads_per_group =
            u32::try_from(program.pipeline.max_total_threads_per_threadgroup()).unwrap_or(u32::MAX);
        Ok(Kernel {
            name: name.to_string(),
            program,
            max_threads_per_group,
        })
    }
}

impl StorageAccessor<MetalTensor> for MetalContext {
    type Buffer = MetalBuffer;

    fn buffer_handle(&self, tensor: &MetalTensor) -> BufferBinding<MetalBuffer> {
        let offset = tensor.storage_offset * tensor.dtype.size();
        BufferBinding::new(tensor.buffer.clone(), offset as u64)
    }
}
