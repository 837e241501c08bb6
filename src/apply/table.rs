use crate::tensor::BufferBinding;

use super::MAX_TENSORS_PER_DISPATCH;

/// Buffer bindings for one dispatch, indexed by `(role, slot)`.
///
/// The kernel reads binding `role * MAX_TENSORS_PER_DISPATCH + slot`; the
/// last role (`depth`) holds the step counters. A table is built for exactly
/// one dispatch and dropped once submitted.
#[derive(Debug, Clone)]
pub struct ArgumentTable<B> {
    depth: usize,
    entries: Vec<Option<BufferBinding<B>>>,
}

impl<B> ArgumentTable<B> {
    pub fn new(depth: usize) -> Self {
        let len = (depth + 1) * MAX_TENSORS_PER_DISPATCH;
        Self {
            depth,
            entries: (0..len).map(|_| None).collect(),
        }
    }

    /// Argument index of `(role, slot)`.
    pub fn index(role: usize, slot: usize) -> usize {
        role * MAX_TENSORS_PER_DISPATCH + slot
    }

    /// Number of tensor roles, not counting the step counters.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total binding capacity.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn set(&mut self, role: usize, slot: usize, binding: BufferBinding<B>) {
        assert!(role <= self.depth, "role {role} out of range");
        assert!(slot < MAX_TENSORS_PER_DISPATCH, "slot {slot} out of range");
        self.entries[Self::index(role, slot)] = Some(binding);
    }

    pub fn set_step(&mut self, slot: usize, binding: BufferBinding<B>) {
        self.set(self.depth, slot, binding);
    }

    pub fn get(&self, role: usize, slot: usize) -> Option<&BufferBinding<B>> {
        if role > self.depth || slot >= MAX_TENSORS_PER_DISPATCH {
            return None;
        }
        self.entries[Self::index(role, slot)].as_ref()
    }

    pub fn step(&self, slot: usize) -> Option<&BufferBinding<B>> {
        self.get(self.depth, slot)
    }

    /// Number of slots holding a tensor.
    pub fn slot_count(&self) -> usize {
        (0..MAX_TENSORS_PER_DISPATCH)
            .filter(|&slot| self.get(0, slot).is_some())
            .count()
    }

    /// Populated bindings with their argument index, in index order.
    pub fn bindings(&self) -> impl Iterator<Item = (usize, &BufferBinding<B>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|binding| (index, binding)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indexing() {
        let mut table = ArgumentTable::new(4);
        assert_eq!(table.capacity(), 5 * 32);
        assert_eq!(table.slot_count(), 0);

        table.set(0, 0, BufferBinding::new(7u64, 0));
        table.set(3, 0, BufferBinding::new(8u64, 16));
        table.set_step(0, BufferBinding::new(9u64, 4));
        table.set(0, 1, BufferBinding::new(10u64, 0));

        assert_eq!(table.slot_count(), 2);
        assert_eq!(table.get(3, 0), Some(&BufferBinding::new(8, 16)));
        assert_eq!(table.step(0), Some(&BufferBinding::new(9, 4)));
        assert_eq!(table.get(5, 0), None);

        let indices: Vec<_> = table.bindings().map(|(index, _)| index).collect();
        assert_eq!(indices, vec![0, 1, 96, 128]);
    }

    #[test]
    #[should_panic]
    fn test_table_rejects_slot_overflow() {
        let mut table = ArgumentTable::new(2);
        table.set(0, MAX_TENSORS_PER_DISPATCH, BufferBinding::new(0u64, 0));
    }
}
