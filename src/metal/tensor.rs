use metal::Buffer;

use crate::tensor::{DataType, TensorRef};

/// A tensor stored in a Metal buffer, `storage_offset` elements in.
#[derive(Clone)]
pub struct MetalTensor {
    pub buffer: Buffer,
    pub storage_offset: usize,
    pub numel: usize,
    pub dtype: DataType,
}

impl MetalTensor {
    pub fn new(buffer: Buffer, numel: usize, dtype: DataType) -> Self {
        Self {
            buffer,
            storage_offset: 0,
            numel,
            dtype,
        }
    }

    /// A view of `numel` elements starting `offset` elements into this tensor.
    pub fn view(&self, offset: usize, numel: usize) -> Self {
        Self {
            buffer: self.buffer.clone(),
            storage_offset: self.storage_offset + offset,
            numel,
            dtype: self.dtype,
        }
    }

    /// Copy the elements back to the host. `T` must match the tensor's dtype size.
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Vec<T> {
        assert_eq!(std::mem::size_of::<T>(), self.dtype.size());
        let start = self.storage_offset * self.dtype.size();
        let len = self.numel * self.dtype.size();
        // SAFETY: shared-storage buffers stay mapped for their lifetime, and
        // `start + len` lies within the buffer this tensor was created from.
        let bytes = unsafe {
            std::slice::from_raw_parts((self.buffer.contents() as *const u8).add(start), len)
        };
        let mut data = vec![T::zeroed(); self.numel];
        bytemuck::cast_slice_mut(&mut data).copy_from_slice(bytes);
        data
    }
}

impl TensorRef for MetalTensor {
    fn numel(&self) -> usize {
        self.numel
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }
}

impl std::fmt::Debug for MetalTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalTensor")
            .field("buffer_length", &self.buffer.length())
            .field("storage_offset", &self.storage_offset)
            .field("numel", &self.numel)
            .field("dtype", &self.dtype)
            .finish()
    }
}
