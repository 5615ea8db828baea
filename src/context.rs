//! Per-operation scratch state.

use crate::field::HashField;
use crate::memory::Reference;

/// The state of an entry, derived on demand from the slot's three fields and
/// the off-heap headers they reference. Never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// The slot was never touched.
    Unknown,

    /// A key is installed but no value has been committed yet.
    InsertNotFinalized,

    /// Key and value are both live.
    Valid,

    /// The value is logically deleted off-heap, but the slot's bookkeeping
    /// has not been retired. Any thread may complete the deletion.
    DeletedNotFinalized,

    /// The slot is fully retired and eligible for reuse.
    Deleted,
}

/// A snapshot of one off-heap region: the reference it was read through and
/// a copy of its bytes.
#[derive(Default)]
pub struct SliceBuffer {
    pub(crate) reference: Reference,
    pub(crate) bytes: Vec<u8>,
    pub(crate) associated: bool,
}

impl SliceBuffer {
    /// Creates an empty buffer.
    pub fn new() -> SliceBuffer {
        SliceBuffer {
            reference: Reference::INVALID,
            bytes: Vec::new(),
            associated: false,
        }
    }

    /// The reference this buffer last observed, possibly invalid or deleted.
    #[inline]
    pub fn reference(&self) -> Reference {
        self.reference
    }

    /// The snapshot bytes. Meaningful only while
    /// [`is_associated`](SliceBuffer::is_associated) is `true`.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns `true` if the buffer holds the bytes of a successfully read
    /// region.
    #[inline]
    pub fn is_associated(&self) -> bool {
        self.associated
    }

    pub(crate) fn invalidate(&mut self) {
        self.reference = Reference::INVALID;
        self.bytes.clear();
        self.associated = false;
    }
}

/// Scratch state for one logical operation.
///
/// A context is never shared between threads. It caches the candidate entry
/// index, the entry state derived for it, the packed hash field observed
/// when the entry was first examined (the expected value for subsequent
/// compare-and-swaps), and snapshots of the entry's key and value. It is
/// reset before every probe; a zeroed hash-field snapshot means no slot has
/// been examined yet.
pub struct ThreadContext {
    pub(crate) entry_index: usize,
    pub(crate) entry_state: EntryState,
    pub(crate) hash_word: HashField,
    pub(crate) key: SliceBuffer,
    pub(crate) value: SliceBuffer,
    pub(crate) new_value: SliceBuffer,
}

impl ThreadContext {
    /// Creates a fresh context.
    pub fn new() -> ThreadContext {
        ThreadContext {
            entry_index: 0,
            entry_state: EntryState::Unknown,
            hash_word: HashField::ZERO,
            key: SliceBuffer::new(),
            value: SliceBuffer::new(),
            new_value: SliceBuffer::new(),
        }
    }

    /// The entry index of the last examined slot.
    #[inline]
    pub fn entry_index(&self) -> usize {
        self.entry_index
    }

    /// The state derived for the last examined slot.
    #[inline]
    pub fn entry_state(&self) -> EntryState {
        self.entry_state
    }

    /// The key snapshot of the last examined slot.
    #[inline]
    pub fn key(&self) -> &SliceBuffer {
        &self.key
    }

    /// The value snapshot of the last examined slot.
    #[inline]
    pub fn value(&self) -> &SliceBuffer {
        &self.value
    }

    /// Forgets everything known about the last examined slot.
    pub fn invalidate(&mut self) {
        self.entry_index = 0;
        self.entry_state = EntryState::Unknown;
        self.hash_word = HashField::ZERO;
        self.key.invalidate();
        self.value.invalidate();
        self.new_value.invalidate();
    }
}

impl Default for ThreadContext {
    fn default() -> ThreadContext {
        ThreadContext::new()
    }
}
