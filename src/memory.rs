//! References to off-heap regions and the memory-manager boundary.
//!
//! The entry set never owns key or value storage directly. Slots hold
//! word-sized [`Reference`]s produced by a [`MemoryManager`], and the set
//! only relies on three observable facts about a reference: whether it is
//! invalid, whether it is the deleted variant of a once-live reference, and
//! whether its encoding is consistent. Everything else, from allocation and
//! reclamation to the bit layout, belongs to the manager.
//!
//! Physical reclamation is deferred: a released region stays mapped until
//! every guard that predates the release has been dropped, so a thread that
//! read a reference out of a slot can keep dereferencing it for the lifetime
//! of its guard.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use seize::{Collector, Guard, Linked, LocalGuard};

/// An opaque, word-sized handle to an off-heap region.
///
/// The zero value is [`Reference::INVALID`]; slots start zeroed, so an
/// untouched slot reads as holding no reference. All other interpretation
/// goes through the [`MemoryManager`] that produced the reference.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Reference(u64);

impl Reference {
    /// The reference of an untouched slot.
    pub const INVALID: Reference = Reference(0);

    /// Reconstructs a reference from its raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Reference {
        Reference(raw)
    }

    /// Returns the raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reference({:#x})", self.0)
    }
}

/// Allocation and reclamation of off-heap regions.
///
/// Implementations define the reference encoding and own the region
/// lifecycle. The entry set requires two properties:
///
/// - [`deleted_variant`](MemoryManager::deleted_variant) must produce a word
///   that differs from every reference a future allocation can return for
///   the same physical location, so a stale compare-and-swap cannot succeed
///   after the location is reused.
/// - [`release`](MemoryManager::release) must defer physical reclamation
///   until no guard predating the release remains, so concurrent readers
///   holding a guard never observe unmapped memory.
pub trait MemoryManager {
    /// The scope token held while reading or retiring this manager's
    /// regions.
    type Guard<'a>
    where
        Self: 'a;

    /// Enters a scope. Regions released while the returned guard is live
    /// stay readable until it is dropped.
    fn enter(&self) -> Self::Guard<'_>;

    /// Allocates a fresh region holding a copy of `data` and returns a live
    /// reference to it.
    fn allocate(&self, data: &[u8]) -> Reference;

    /// Hands the region behind `reference` back to the manager.
    ///
    /// # Safety
    ///
    /// The caller must be the unique releaser of the region: `reference`
    /// must be a live (or deleted-variant) reference whose region has not
    /// been released before, typically established by winning the
    /// compare-and-swap that unpublished it.
    unsafe fn release(&self, reference: Reference, guard: &Self::Guard<'_>);

    /// Immediately reclaims the region behind `reference`, bypassing
    /// deferral.
    ///
    /// # Safety
    ///
    /// No other thread may be able to reach `reference`, and its region must
    /// not have been released already. Intended for teardown with exclusive
    /// access.
    unsafe fn destroy(&self, reference: Reference);

    /// Copies the region's bytes into `dst`. Returns `false` without
    /// touching `dst`'s contents if the reference is invalid or deleted, or
    /// if the region carries the off-heap deleted marker.
    ///
    /// # Safety
    ///
    /// `reference` must have been loaded from a live slot after `guard` was
    /// entered, so the region cannot have been reclaimed.
    unsafe fn read(&self, reference: Reference, dst: &mut Vec<u8>, guard: &Self::Guard<'_>)
        -> bool;

    /// Marks the region's off-heap header as logically deleted. Returns
    /// `true` if this call performed the marking, `false` if it was already
    /// marked or the reference does not address a region.
    ///
    /// # Safety
    ///
    /// Same requirement as [`read`](MemoryManager::read).
    unsafe fn logical_delete(&self, reference: Reference, guard: &Self::Guard<'_>) -> bool;

    /// Returns `true` for the invalid (never-assigned) reference.
    fn is_invalid(&self, reference: Reference) -> bool;

    /// Returns `true` if the reference is the deleted variant of a once-live
    /// reference.
    fn is_deleted(&self, reference: Reference) -> bool;

    /// Returns `true` if the reference is a well-formed encoding (invalid,
    /// live, or properly retired).
    fn is_consistent(&self, reference: Reference) -> bool;

    /// Transforms a live reference into its deleted variant.
    fn deleted_variant(&self, reference: Reference) -> Reference;

    /// Currently allocated bytes, for memory accounting.
    fn allocated(&self) -> usize;
}

// Reference layout used by `HeapManager`:
// 48-bit region address, 15-bit allocation generation, 1-bit deleted flag.
const ADDRESS_BITS: u32 = 48;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const GENERATION_BITS: u32 = 15;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const GENERATION_SHIFT: u32 = ADDRESS_BITS;
const DELETED_BIT: u64 = 1 << 63;

// Region header: bit 0 is the logical-delete marker, the generation sits
// above it.
const HEADER_DELETED: u64 = 1;

struct Region {
    header: AtomicU64,
    data: Box<[u8]>,
}

/// The default [`MemoryManager`]: regions on the global allocator, scopes
/// and deferred reclamation provided by a [`seize::Collector`].
///
/// References pack the region address with an allocation generation; the
/// generation is also stamped into the region header. A reference retired
/// in favor of its deleted variant therefore differs from any reference a
/// later allocation at the same address can produce, in both the deleted
/// bit and (for live references) the generation.
pub struct HeapManager {
    collector: Collector,
    generation: AtomicU64,
    bytes: AtomicUsize,
}

impl HeapManager {
    /// Creates a manager with its own collector.
    pub fn new() -> HeapManager {
        HeapManager {
            collector: Collector::new(),
            // Generation zero is never allocated, so a consistent live
            // reference always carries a nonzero generation.
            generation: AtomicU64::new(1),
            bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn region(reference: Reference) -> *mut Linked<Region> {
        (reference.raw() & ADDRESS_MASK) as usize as *mut Linked<Region>
    }

    #[inline]
    fn generation_of(reference: Reference) -> u64 {
        (reference.raw() >> GENERATION_SHIFT) & GENERATION_MASK
    }
}

impl Default for HeapManager {
    fn default() -> HeapManager {
        HeapManager::new()
    }
}

impl MemoryManager for HeapManager {
    type Guard<'a>
        = LocalGuard<'a>
    where
        Self: 'a;

    fn enter(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    fn allocate(&self, data: &[u8]) -> Reference {
        let mut generation = self.generation.fetch_add(1, Ordering::Relaxed) & GENERATION_MASK;
        if generation == 0 {
            // The counter wrapped; skip the reserved generation.
            generation = self.generation.fetch_add(1, Ordering::Relaxed) & GENERATION_MASK;
        }

        let region = self.collector.link_boxed(Region {
            header: AtomicU64::new(generation << 1),
            data: data.into(),
        });

        let address = region as usize as u64;
        debug_assert_eq!(address & !ADDRESS_MASK, 0);

        self.bytes.fetch_add(data.len(), Ordering::Relaxed);
        Reference::from_raw(address | (generation << GENERATION_SHIFT))
    }

    unsafe fn release(&self, reference: Reference, guard: &LocalGuard<'_>) {
        debug_assert!(!self.is_invalid(reference));

        let region = Self::region(reference);
        // Safety: the caller is the unique releaser, so the region is still
        // mapped here.
        self.bytes
            .fetch_sub(unsafe { (**region).data.len() }, Ordering::Relaxed);

        // Safety: the caller is the unique releaser; reclamation is deferred
        // past every guard live at this point.
        unsafe { guard.defer_retire(region, seize::reclaim::boxed::<Linked<Region>>) };
    }

    unsafe fn destroy(&self, reference: Reference) {
        debug_assert!(!self.is_invalid(reference));

        let region = Self::region(reference);
        // Safety: the caller has exclusive access and the region was never
        // released.
        self.bytes
            .fetch_sub(unsafe { (**region).data.len() }, Ordering::Relaxed);
        drop(unsafe { Box::from_raw(region) });
    }

    unsafe fn read(
        &self,
        reference: Reference,
        dst: &mut Vec<u8>,
        _guard: &LocalGuard<'_>,
    ) -> bool {
        if self.is_invalid(reference) || self.is_deleted(reference) {
            return false;
        }

        // Safety: the reference is live and the caller holds a guard, so the
        // region is mapped even if it was released concurrently.
        let region = unsafe { &(*Self::region(reference)).value };

        let header = region.header.load(Ordering::Acquire);
        if header & HEADER_DELETED != 0 {
            return false;
        }

        // A generation mismatch means the address was reclaimed and reused;
        // the reference is stale and its region logically gone.
        if (header >> 1) & GENERATION_MASK != Self::generation_of(reference) {
            return false;
        }

        dst.clear();
        dst.extend_from_slice(&region.data);
        true
    }

    unsafe fn logical_delete(&self, reference: Reference, _guard: &LocalGuard<'_>) -> bool {
        if self.is_invalid(reference) {
            return false;
        }

        // Safety: the caller holds a guard covering the reference.
        let region = unsafe { &(*Self::region(reference)).value };
        let previous = region.header.fetch_or(HEADER_DELETED, Ordering::AcqRel);
        previous & HEADER_DELETED == 0
    }

    #[inline]
    fn is_invalid(&self, reference: Reference) -> bool {
        reference.raw() == 0
    }

    #[inline]
    fn is_deleted(&self, reference: Reference) -> bool {
        reference.raw() & DELETED_BIT != 0
    }

    #[inline]
    fn is_consistent(&self, reference: Reference) -> bool {
        self.is_invalid(reference)
            || (reference.raw() & ADDRESS_MASK != 0 && Self::generation_of(reference) != 0)
    }

    #[inline]
    fn deleted_variant(&self, reference: Reference) -> Reference {
        Reference::from_raw(reference.raw() | DELETED_BIT)
    }

    #[inline]
    fn allocated(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}
