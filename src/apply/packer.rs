//! Greedy packing of tensor chunks into bounded dispatches.
//!
//! [`Packer`] walks the element counts once, in list order, and yields one
//! [`PackedDispatch`] each time either the argument table or the work-group
//! table fills, plus a final tail dispatch for whatever is left. It does no
//! I/O, so the same plan can be inspected without a device.

use super::{
    ApplyError, MetadataArguments, CHUNK_SIZE, MAX_TENSORS_PER_DISPATCH, MAX_THREADGROUPS,
};

/// Number of chunks covering `numel` elements.
///
/// The kernel addresses elements through 32-bit metadata, so a tensor whose
/// element count does not fit is rejected.
pub fn chunk_count(numel: usize) -> Result<usize, ApplyError> {
    if u32::try_from(numel).is_err() {
        return Err(ApplyError::ChunkCount { numel });
    }
    Ok(numel.div_ceil(CHUNK_SIZE))
}

/// Position of the packing loop inside the dispatch being built.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackingCursor {
    /// Slots used in the current argument table.
    pub tensor_loc: usize,
    /// Work-groups recorded in the current metadata.
    pub threadgroup_loc: usize,
}

impl PackingCursor {
    /// The table cannot take another tensor.
    pub fn tensors_full(&self) -> bool {
        self.tensor_loc == MAX_TENSORS_PER_DISPATCH
    }

    /// The dispatch cannot take another work-group.
    pub fn blocks_full(&self) -> bool {
        self.threadgroup_loc == MAX_THREADGROUPS
    }

    pub fn is_empty(&self) -> bool {
        self.threadgroup_loc == 0
    }
}

/// One planned dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedDispatch {
    slots: [usize; MAX_TENSORS_PER_DISPATCH],
    slot_count: usize,
    pub metadata: MetadataArguments,
    pub threadgroups: usize,
    /// Slot 0 holds a tensor whose earlier chunks went out in the previous dispatch.
    pub continued: bool,
}

impl PackedDispatch {
    /// Source tensor index held by each slot, in slot order.
    pub fn slots(&self) -> &[usize] {
        &self.slots[..self.slot_count]
    }

    /// `(slot, chunk)` for each launched work-group.
    pub fn threadgroups(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.metadata.threadgroups(self.threadgroups)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTensor {
    index: usize,
    numel: usize,
    chunks: usize,
    next_chunk: usize,
    slot: usize,
}

/// Streaming planner over the element counts of one call.
///
/// Zero-element tensors are skipped entirely. Stops after the first error.
#[derive(Debug, Clone)]
pub struct Packer<'a> {
    numels: &'a [usize],
    next_index: usize,
    active: Option<ActiveTensor>,
    cursor: PackingCursor,
    slots: [usize; MAX_TENSORS_PER_DISPATCH],
    metadata: MetadataArguments,
    continued: bool,
    done: bool,
}

impl<'a> Packer<'a> {
    pub fn new(numels: &'a [usize]) -> Self {
        Self {
            numels,
            next_index: 0,
            active: None,
            cursor: PackingCursor::default(),
            slots: [0; MAX_TENSORS_PER_DISPATCH],
            metadata: MetadataArguments::new(),
            continued: false,
            done: false,
        }
    }

    pub fn cursor(&self) -> PackingCursor {
        self.cursor
    }

    /// Put tensor `index` into the next free slot.
    fn register(&mut self, index: usize, numel: usize) -> Result<ActiveTensor, ApplyError> {
        let chunks = chunk_count(numel)?;
        let slot = self.cursor.tensor_loc;
        self.slots[slot] = index;
        self.metadata.numels[slot] = numel as u32;
        self.cursor.tensor_loc += 1;

        log::trace!("tensor {index}: {numel} elements, {chunks} chunks, slot {slot}");
        Ok(ActiveTensor {
            index,
            numel,
            chunks,
            next_chunk: 0,
            slot,
        })
    }

    /// Hand out the dispatch built so far and start an empty one.
    fn flush(&mut self) -> PackedDispatch {
        let dispatch = PackedDispatch {
            slots: self.slots,
            slot_count: self.cursor.tensor_loc,
            metadata: self.metadata,
            threadgroups: self.cursor.threadgroup_loc,
            continued: self.continued,
        };
        self.cursor = PackingCursor::default();
        self.slots = [0; MAX_TENSORS_PER_DISPATCH];
        self.metadata = MetadataArguments::new();
        self.continued = false;
        dispatch
    }

    /// Carry an unfinished tensor into slot 0 of the next dispatch.
    fn reseed(&mut self, tensor: &mut ActiveTensor) {
        self.slots[0] = tensor.index;
        self.metadata.numels[0] = tensor.numel as u32;
        self.cursor.tensor_loc = 1;
        self.continued = true;
        tensor.slot = 0;
    }

    fn next_nonempty(&mut self) -> Option<(usize, usize)> {
        while let Some(&numel) = self.numels.get(self.next_index) {
            let index = self.next_index;
            self.next_index += 1;
            if numel != 0 {
                return Some((index, numel));
            }
            log::trace!("tensor {index}: empty, skipped");
        }
        None
    }
}

impl Iterator for Packer<'_> {
    type Item = Result<PackedDispatch, ApplyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let mut tensor = match self.active.take() {
                Some(tensor) => tensor,
                None => match self.next_nonempty() {
                    Some((index, numel)) => match self.register(index, numel) {
                        Ok(tensor) => tensor,
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    },
                    None => {
                        self.done = true;
                        if self.cursor.is_empty() {
                            return None;
                        }
                        return Some(Ok(self.flush()));
                    }
                },
            };

            while tensor.next_chunk < tensor.chunks {
                let chunk = tensor.next_chunk;
                tensor.next_chunk += 1;

                let group = self.cursor.threadgroup_loc;
                self.metadata.threadgroup_to_tensor[group] = tensor.slot as u32;
                self.metadata.threadgroup_to_chunk[group] = chunk as u32;
                self.cursor.threadgroup_loc += 1;

                let last_chunk = chunk == tensor.chunks - 1;
                let tensor_full = self.cursor.tensors_full() && last_chunk;
                if tensor_full || self.cursor.blocks_full() {
                    let dispatch = self.flush();
                    if !last_chunk {
                        self.reseed(&mut tensor);
                        self.active = Some(tensor);
                    }
                    return Some(Ok(dispatch));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for Packer<'_> {}
