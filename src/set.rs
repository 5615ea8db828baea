//! The entry hash set.
//!
//! A fixed-capacity, open-addressed table whose slots reference off-heap
//! keys and values. Entries are placed by key hash and probed along a
//! bounded run of consecutive slots (cyclic); the run's bound adapts to
//! collisions and only ever grows for the lifetime of the table. Growth
//! beyond the table capacity is fatal; replacing the table is the owner's
//! job, not this module's.
//!
//! All coordination is per-word compare-and-swap on the three fields of a
//! slot. There is no consistent snapshot across a slot's fields: every
//! decision is derived from fresh reads, and every destructive step is a
//! single-word CAS guarded by an expected value captured moments earlier.
//! Multi-step protocols (insert, delete) are built so that a stalled
//! thread's partial progress can be completed idempotently by any helper
//! that encounters it.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, warn};

use crate::context::{EntryState, SliceBuffer, ThreadContext};
use crate::entries::EntryArray;
use crate::error::Error;
use crate::memory::{MemoryManager, Reference};
use crate::serialize::KeyCodec;

/// The initial bound on collision-chain probing.
pub const DEFAULT_COLLISION_CHAIN: usize = 4;

/// The whole-operation retry budget callers are expected to apply when an
/// operation keeps losing races and restarting.
pub const MAX_RETRIES: usize = 1024;

/// A set of entries placed according to key hash, with keys and values
/// stored off-heap.
///
/// The set arbitrates concurrent lookup, insertion, and deletion over its
/// slots; serialization of keys is delegated to a [`KeyCodec`] and region
/// lifecycle to a [`MemoryManager`]. Values are opaque byte regions at this
/// layer.
///
/// Operations that can complete a pending deletion, and therefore release
/// off-heap regions, must run inside a scope obtained from
/// [`guard`](EntryHashSet::guard) (or directly from the manager). Lookups
/// take the same guard because they read through references that a
/// concurrent deletion may retire.
pub struct EntryHashSet<K, C, M: MemoryManager> {
    array: EntryArray<M>,
    codec: C,

    // How many consecutive slots a probe inspects before giving up.
    // Monotonically non-decreasing; reset only by constructing a new table.
    collision_chain: AtomicUsize,

    _key: PhantomData<fn(&K)>,
}

impl<K, C, M> EntryHashSet<K, C, M>
where
    C: KeyCodec<K>,
    M: MemoryManager,
{
    /// Creates a set with `capacity` entry slots.
    ///
    /// The capacity is fixed: the set never resizes in place.
    pub fn new(capacity: usize, memory: M, codec: C) -> EntryHashSet<K, C, M> {
        EntryHashSet {
            array: EntryArray::new(capacity, memory),
            codec,
            collision_chain: AtomicUsize::new(DEFAULT_COLLISION_CHAIN.min(capacity)),
            _key: PhantomData,
        }
    }

    /// Overrides the initial collision-chain bound.
    pub fn initial_chain_bound(self, bound: usize) -> EntryHashSet<K, C, M> {
        assert!(
            bound >= 1 && bound <= self.array.capacity(),
            "chain bound must be in 1..=capacity"
        );
        self.collision_chain.store(bound, Ordering::Relaxed);
        self
    }

    /// Enters a memory-safety scope for this set's regions.
    pub fn guard(&self) -> M::Guard<'_> {
        self.array.memory().enter()
    }

    /// Creates the per-operation scratch context.
    pub fn thread_context(&self) -> ThreadContext {
        ThreadContext::new()
    }

    /// The fixed number of entry slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.array.capacity()
    }

    /// The number of live entries.
    #[inline]
    pub fn entries(&self) -> usize {
        self.array.count()
    }

    /// Off-heap bytes currently allocated for this set's keys and values.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.array.memory_size()
    }

    /// The current adaptive collision-chain bound.
    ///
    /// Owners watch this to decide when the table is degenerate enough to
    /// stop accepting insertions and be replaced.
    #[inline]
    pub fn collision_chain_length(&self) -> usize {
        self.collision_chain.load(Ordering::Relaxed)
    }

    /// The memory manager backing this set.
    #[inline]
    pub fn memory(&self) -> &M {
        self.array.memory()
    }

    /// Derives the state of the entry at `ei`.
    ///
    /// On anything but [`EntryState::Unknown`], the context's key/value
    /// snapshots and hash-field snapshot reflect the slot's contents at a
    /// consistent point per field; the triple as a whole is not atomic.
    fn entry_state(
        &self,
        ctx: &mut ThreadContext,
        ei: usize,
        key: &K,
        hash: u32,
        guard: &M::Guard<'_>,
    ) -> EntryState {
        ctx.hash_word = self.array.hash_word(ei);

        if self.memory().is_invalid(self.array.key_reference(ei)) {
            return EntryState::Unknown;
        }

        // The slot has been claimed. Deletion linearizes on the off-heap
        // deleted marker of the value: once marked, the slot is logically
        // gone even though the bookkeeping CASes may not have run yet.
        if !self.memory().is_invalid(self.array.value_reference(ei)) {
            if !self.array.read_value(&mut ctx.value, ei, guard) {
                if self.array.read_key(&mut ctx.key, ei, guard) {
                    // The key is still readable: either an unfinished
                    // delete, or a fresh insert reusing a retired slot. The
                    // hash-field valid bit disambiguates; deletion clears
                    // it last, insertion sets it last.
                    if self.array.hash_word(ei).is_valid() {
                        return EntryState::DeletedNotFinalized;
                    }
                    // A not-yet-finalized insert; classified below.
                } else {
                    return if self.array.hash_word(ei).is_valid() {
                        EntryState::DeletedNotFinalized
                    } else {
                        EntryState::Deleted
                    };
                }
            }
        }

        if !self.array.read_key(&mut ctx.key, ei, guard) {
            // The key is gone; only the hash-field retirement may remain.
            return if self.array.hash_word(ei).is_valid() {
                EntryState::DeletedNotFinalized
            } else {
                EntryState::Deleted
            };
        }

        if self.array.read_value(&mut ctx.value, ei, guard) {
            return EntryState::Valid;
        }

        // No committed value. If the key is ours this is an insert in
        // flight; otherwise the slot holds a distinct mapping.
        if self.key_equal(ctx, key, ei, hash) {
            return EntryState::InsertNotFinalized;
        }

        EntryState::Valid
    }

    /// Compares the caller's key against the slot's key snapshot, using the
    /// slot's cached hash as a pre-filter when it is valid.
    fn key_equal(&self, ctx: &ThreadContext, key: &K, ei: usize, hash: u32) -> bool {
        let word = self.array.hash_word(ei);
        if word.is_valid() && word.hash() != hash {
            return false;
        }

        debug_assert!(ctx.key.is_associated());
        self.codec.compare(key, ctx.key.bytes()).is_eq()
    }

    /// Checks whether `key` exists at `idx` or within the collision chain
    /// after it.
    ///
    /// Returns `true` only if a fully valid entry holds the key; a match in
    /// any deletion stage means the key does not currently exist, and a
    /// match on a not-yet-finalized insert is not observable. On `true`,
    /// the context describes the found entry, key and value snapshots
    /// included.
    pub fn look_up(
        &self,
        ctx: &mut ThreadContext,
        key: &K,
        idx: usize,
        hash: u32,
        guard: &M::Guard<'_>,
    ) -> bool {
        let chain = self.collision_chain.load(Ordering::Relaxed);

        for i in 0..chain {
            ctx.invalidate();
            let ei = (idx + i) % self.array.capacity();
            ctx.entry_index = ei;
            ctx.entry_state = self.entry_state(ctx, ei, key, hash, guard);

            if ctx.entry_state == EntryState::Unknown {
                // An untouched slot proves the key cannot appear further in
                // this chain: inserts never skip a vacant earlier slot for
                // the same initial index.
                ctx.invalidate();
                return false;
            }

            // The key snapshot of a deleted entry cannot be compared.
            if !matches!(
                ctx.entry_state,
                EntryState::Deleted | EntryState::DeletedNotFinalized
            ) && self.key_equal(ctx, key, ei, hash)
            {
                return ctx.entry_state == EntryState::Valid;
            }
        }

        ctx.invalidate();
        false
    }

    /// Finds the entry where `key` is going to be inserted.
    ///
    /// On return the context points at either an entry already representing
    /// the key (`Valid` or `InsertNotFinalized`) or a vacant candidate
    /// (`Unknown` or `Deleted`). Pending deletions encountered along the
    /// chain are completed in place, which is why the caller's guard is
    /// required.
    fn find_suitable_entry_for_insert(
        &self,
        ctx: &mut ThreadContext,
        key: &K,
        idx: usize,
        hash: u32,
        guard: &M::Guard<'_>,
    ) -> Result<(), Error> {
        loop {
            let chain = self.collision_chain.load(Ordering::Relaxed);

            'slots: for i in 0..chain {
                ctx.invalidate();
                let ei = (idx + i) % self.array.capacity();
                ctx.entry_index = ei;
                ctx.entry_state = self.entry_state(ctx, ei, key, hash, guard);

                loop {
                    match ctx.entry_state {
                        EntryState::Valid => {
                            if self.key_equal(ctx, key, ei, hash) {
                                // The key exists; inserted keys are unique,
                                // so the caller refuses or reuses upstream.
                                return Ok(());
                            }
                            continue 'slots;
                        }

                        EntryState::DeletedNotFinalized => {
                            // Help the stalled delete, then re-derive this
                            // same slot without consuming a chain position.
                            self.delete_value_finish(ctx, guard);
                            ctx.entry_state = self.entry_state(ctx, ei, key, hash, guard);
                        }

                        // Vacant, or mid-insert of this very key (the state
                        // machine only reports `InsertNotFinalized` for a
                        // matching key).
                        EntryState::Deleted
                        | EntryState::Unknown
                        | EntryState::InsertNotFinalized => return Ok(()),
                    }
                }
            }

            // Every candidate in the chain is occupied.
            self.grow_collision_chain(idx, chain)?;
        }
    }

    /// Grows the collision-chain bound by one, with escalating diagnostics.
    #[cold]
    fn grow_collision_chain(&self, idx: usize, chain: usize) -> Result<(), Error> {
        let capacity = self.array.capacity();

        // When the exhausted chain carries distinct key hashes, growing the
        // chain does not reduce collisions; only a table split by the owner
        // would. There is no split path at this layer, so say so loudly and
        // grow anyway.
        let mut distinct_hashes = false;
        let mut location = idx;
        let mut remaining = chain;
        while remaining > 1 {
            let next = (location + 1) % capacity;
            if self.array.hash_word(location).hash() != self.array.hash_word(next).hash() {
                distinct_hashes = true;
                break;
            }
            location = next;
            remaining -= 1;
        }
        if distinct_hashes {
            warn!(
                start = idx,
                chain,
                "probed entries hold distinct key hashes; the table needs a split, growing the chain instead"
            );
        }

        let current = self.collision_chain.load(Ordering::Relaxed);
        if current == DEFAULT_COLLISION_CHAIN * 10 {
            warn!(chain = current, "many collisions for the hash function");
        }
        if current == DEFAULT_COLLISION_CHAIN * 20 {
            warn!(
                chain = current,
                "collision chain growth will degrade performance; check the hash function"
            );
        }

        if current + 1 > capacity {
            error!(
                chain = current,
                capacity, "too many collisions to keep in one table"
            );
            return Err(Error::CollisionOverflow {
                chain: current,
                capacity,
            });
        }

        // A lost race means another thread grew the chain on our behalf.
        let _ = self.collision_chain.compare_exchange(
            current,
            current + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Creates an entry for `key`: the key is serialized off-heap and its
    /// reference installed into a suitable slot, leaving the entry with no
    /// committed value.
    ///
    /// `idx` is the initial probe index (key hash modulo capacity) and
    /// `hash` the key hash. On success the context points at the entry; if
    /// its state is [`EntryState::Valid`] the key already existed with a
    /// committed value and nothing was allocated, while on
    /// [`EntryState::InsertNotFinalized`] the caller competes to attach the
    /// value with [`write_value`](EntryHashSet::write_value) and
    /// [`link_value`](EntryHashSet::link_value).
    ///
    /// The hash-field update is the linearization point that makes the key
    /// discoverable by hash. Lost races are resolved by re-deriving
    /// everything from fresh reads and retrying; callers bound the restarts
    /// with [`MAX_RETRIES`].
    pub fn allocate_entry_and_write_key(
        &self,
        ctx: &mut ThreadContext,
        key: &K,
        idx: usize,
        hash: u32,
        guard: &M::Guard<'_>,
    ) -> Result<(), Error> {
        ctx.invalidate();

        if idx >= self.array.capacity() {
            // An illegal argument, not a signal to rebalance or retry.
            return Err(Error::IndexOutOfBounds {
                index: idx,
                capacity: self.array.capacity(),
            });
        }

        loop {
            self.find_suitable_entry_for_insert(ctx, key, idx, hash, guard)?;

            if matches!(
                ctx.entry_state,
                EntryState::Valid | EntryState::InsertNotFinalized
            ) {
                // The key already has its entry.
                return Ok(());
            }

            // The chosen entry is untouched or fully retired. Capture the
            // observed words to fence our CASes, then publish a fresh key.
            let ei = ctx.entry_index;
            let expected_key = ctx.key.reference();
            let expected_word = ctx.hash_word;
            let new_key = self.write_key(key, &mut ctx.key);

            if self.array.cas_key_reference(ei, expected_key, new_key) {
                // Only one writer gets here per expected value. Publishing
                // the hash makes the key discoverable for comparison.
                if self
                    .array
                    .cas_hash_word(ei, expected_word, expected_word.install(hash))
                {
                    self.array.increment_count();
                    return Ok(());
                }

                // A conflicting update to the hash field beat us, possibly
                // a deletion of everything we just observed. Re-derive.
                ctx.invalidate();
                continue;
            }

            // Lost the slot. The region we serialized was never published.
            // Safety: `new_key` was allocated above and never shared.
            unsafe { self.memory().release(new_key, guard) };

            // If the winner installed our own key, help it along instead of
            // restarting: the caller proceeds to value assignment.
            if self.array.read_key(&mut ctx.key, ei, guard) && self.key_equal(ctx, key, ei, hash) {
                return Ok(());
            }

            ctx.invalidate();
        }
    }

    /// Serializes `key` into a fresh off-heap region, recording it in `buf`.
    fn write_key(&self, key: &K, buf: &mut SliceBuffer) -> Reference {
        buf.invalidate();
        self.codec.serialize(key, &mut buf.bytes);
        let reference = self.memory().allocate(&buf.bytes);
        buf.reference = reference;
        buf.associated = true;
        reference
    }

    /// Stages a value region for the context's entry.
    ///
    /// The value is serialized by the caller; this layer treats it as
    /// opaque bytes. [`link_value`](EntryHashSet::link_value) publishes it.
    pub fn write_value(&self, ctx: &mut ThreadContext, value: &[u8]) {
        ctx.new_value.invalidate();
        let reference = self.memory().allocate(value);
        ctx.new_value.reference = reference;
        ctx.new_value.bytes.extend_from_slice(value);
        ctx.new_value.associated = true;
    }

    /// Publishes the staged value: a single CAS against the value reference
    /// observed when the entry was examined (invalid for a fresh entry, or
    /// the retired reference of the previous occupant).
    ///
    /// Returns `false` if a concurrent update won; the staged region is
    /// handed back to the manager.
    pub fn link_value(&self, ctx: &mut ThreadContext, guard: &M::Guard<'_>) -> bool {
        let new = ctx.new_value.reference();
        debug_assert!(!self.memory().is_invalid(new) && !self.memory().is_deleted(new));

        let expected = ctx.value.reference();
        if self.array.cas_value_reference(ctx.entry_index, expected, new) {
            std::mem::swap(&mut ctx.value, &mut ctx.new_value);
            ctx.new_value.invalidate();
            ctx.entry_state = EntryState::Valid;
            return true;
        }

        // Lost the race; the staged region was never published.
        // Safety: allocated by `write_value` on this context, never shared.
        unsafe { self.memory().release(new, guard) };
        ctx.new_value.invalidate();
        false
    }

    /// Marks the context's value region as logically deleted off-heap.
    ///
    /// This is the linearization point of deletion: once it succeeds the
    /// mapping is gone for every observer, and any thread can finish the
    /// bookkeeping with
    /// [`delete_value_finish`](EntryHashSet::delete_value_finish). Returns
    /// `true` if this call performed the marking.
    pub fn mark_value_deleted(&self, ctx: &ThreadContext, guard: &M::Guard<'_>) -> bool {
        // Safety: the context's value reference was observed under `guard`.
        unsafe { self.memory().logical_delete(ctx.value.reference(), guard) }
    }

    /// Completes a deletion whose linearization point, the off-heap deleted
    /// marker on the value, has already been reached.
    ///
    /// Each remaining step is an independent CAS against the reference or
    /// word observed in `ctx`, so any number of helpers can run this
    /// concurrently: a step already done by another thread is skipped. The
    /// value reference is swapped for its deleted variant (never merely
    /// reused, so a stale CAS cannot succeed after the region's memory is
    /// recycled) and its region released; the key likewise; finally the
    /// hash field is invalidated and the live-entry count decremented,
    /// exactly once across all helpers.
    ///
    /// Returns `false` if the slot was already fully retired when this call
    /// started.
    pub fn delete_value_finish(&self, ctx: &mut ThreadContext, guard: &M::Guard<'_>) -> bool {
        let ei = ctx.entry_index;
        let expected_value = ctx.value.reference();
        let expected_key = ctx.key.reference();

        let current = self.array.hash_word(ei);
        if current.hash() == ctx.hash_word.hash() && !current.is_valid() {
            // Same hash we observed, already invalidated: the last stage of
            // this deletion is done.
            ctx.entry_state = EntryState::Deleted;
            return false;
        }

        // Mark the key region deleted off-heap. Best effort: the reference
        // CAS below is the authoritative step, and if the key reference is
        // already retired the region was marked by whoever retired it.
        let key_already_retired = self.memory().is_deleted(expected_key);
        if !key_already_retired {
            // Safety: the key reference was observed under `guard`.
            unsafe { self.memory().logical_delete(expected_key, guard) };
        }

        if !self.memory().is_deleted(expected_value) {
            let retired = self.memory().deleted_variant(expected_value);
            if self.array.cas_value_reference(ei, expected_value, retired) {
                debug_assert!(self.memory().is_consistent(self.array.value_reference(ei)));
                // Safety: the CAS made this thread the unique releaser;
                // reclamation is deferred past `guard`.
                unsafe { self.memory().release(expected_value, guard) };
                ctx.value.invalidate();
            }
        }

        if !key_already_retired {
            let retired = self.memory().deleted_variant(expected_key);
            if self.array.cas_key_reference(ei, expected_key, retired) {
                debug_assert!(self.memory().is_consistent(self.array.key_reference(ei)));
                // Safety: the CAS made this thread the unique releaser.
                unsafe { self.memory().release(expected_key, guard) };
                ctx.key.invalidate();
            }
        }

        // Clearing the valid bit is the last stage; whoever lands it owns
        // the count decrement.
        if self
            .array
            .cas_hash_word(ei, ctx.hash_word, ctx.hash_word.invalidate())
        {
            self.array.decrement_count();
            ctx.entry_state = EntryState::Deleted;
        }

        true
    }

    /// Checks whether the entry at `ei` is deleted, on-slot or off-heap.
    ///
    /// A pure read: an absent value reference and an off-heap deleted
    /// marker both count as deleted.
    pub fn is_entry_deleted(&self, buf: &mut SliceBuffer, ei: usize, guard: &M::Guard<'_>) -> bool {
        debug_assert!(ei < self.array.capacity());
        !self.array.read_value(buf, ei, guard)
    }
}

impl<K, C, M: MemoryManager> Drop for EntryHashSet<K, C, M> {
    fn drop(&mut self) {
        // Slots still holding live references own their regions; retired
        // references were already released through the manager.
        for ei in 0..self.array.capacity() {
            for reference in [self.array.key_reference(ei), self.array.value_reference(ei)] {
                if !self.array.memory().is_invalid(reference)
                    && !self.array.memory().is_deleted(reference)
                {
                    // Safety: `&mut self` gives exclusive access, and a
                    // non-retired reference was never released.
                    unsafe { self.array.memory().destroy(reference) };
                }
            }
        }
    }
}
