//! The slot array underlying the entry hash set.
//!
//! Each entry is three co-located words: the key reference, the value
//! reference, and the packed hash field. The array is allocated zeroed, and
//! the all-zero entry decodes as "untouched" in every field, so no
//! initialization pass is needed. Cross-field reads are not atomic; callers
//! derive decisions from fresh per-field reads and fence their writes with
//! per-field compare-and-swap.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::context::SliceBuffer;
use crate::field::HashField;
use crate::memory::{MemoryManager, Reference};

#[derive(Default)]
struct Slot {
    key: AtomicU64,
    value: AtomicU64,
    hash: AtomicU64,
}

/// Fixed-capacity storage for entries, plus the live-entry counter and the
/// owning memory manager.
pub(crate) struct EntryArray<M> {
    slots: Box<[Slot]>,
    count: AtomicUsize,
    memory: M,
}

impl<M: MemoryManager> EntryArray<M> {
    pub(crate) fn new(capacity: usize, memory: M) -> EntryArray<M> {
        assert!(capacity > 0, "entry capacity must be nonzero");

        EntryArray {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            count: AtomicUsize::new(0),
            memory,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn memory(&self) -> &M {
        &self.memory
    }

    /// The number of live entries (installed keys not yet retired).
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn increment_count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decrement_count(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn key_reference(&self, ei: usize) -> Reference {
        Reference::from_raw(self.slots[ei].key.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn value_reference(&self, ei: usize) -> Reference {
        Reference::from_raw(self.slots[ei].value.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn hash_word(&self, ei: usize) -> HashField {
        HashField::from_raw(self.slots[ei].hash.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn cas_key_reference(&self, ei: usize, old: Reference, new: Reference) -> bool {
        self.slots[ei]
            .key
            .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn cas_value_reference(&self, ei: usize, old: Reference, new: Reference) -> bool {
        self.slots[ei]
            .value
            .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn cas_hash_word(&self, ei: usize, old: HashField, new: HashField) -> bool {
        self.slots[ei]
            .hash
            .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reads the entry's key into `buf`. The observed reference is recorded
    /// in the buffer even when the read fails; the bytes are filled only on
    /// success. Fails for invalid and deleted references and for regions
    /// carrying the off-heap deleted marker.
    pub(crate) fn read_key(&self, buf: &mut SliceBuffer, ei: usize, guard: &M::Guard<'_>) -> bool {
        let reference = self.key_reference(ei);
        self.read(reference, buf, guard)
    }

    /// Reads the entry's value into `buf`, with the same contract as
    /// [`read_key`](EntryArray::read_key).
    pub(crate) fn read_value(
        &self,
        buf: &mut SliceBuffer,
        ei: usize,
        guard: &M::Guard<'_>,
    ) -> bool {
        let reference = self.value_reference(ei);
        self.read(reference, buf, guard)
    }

    fn read(&self, reference: Reference, buf: &mut SliceBuffer, guard: &M::Guard<'_>) -> bool {
        buf.invalidate();
        buf.reference = reference;

        if self.memory.is_invalid(reference) || self.memory.is_deleted(reference) {
            return false;
        }

        // Safety: the reference was loaded from a live slot under `guard`,
        // so its region stays mapped for the read.
        if unsafe { self.memory.read(reference, &mut buf.bytes, guard) } {
            buf.associated = true;
            return true;
        }

        false
    }

    /// Off-heap bytes currently held by the memory manager.
    #[inline]
    pub(crate) fn memory_size(&self) -> usize {
        self.memory.allocated()
    }
}
