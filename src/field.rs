// The packed hash field of an entry slot.
//
// One 64-bit word per slot carries everything needed to pre-filter key
// comparisons and to fence concurrent updates:
//
// - the 32-bit key hash,
// - a 31-bit update counter, bumped on every successful transition of the
//   field (insert-finalize and delete-finalize), so a compare-and-swap with
//   a stale expected value can never succeed,
// - a validity bit, set the instant a key reference is installed and cleared
//   as the last step of deletion.
//
// Slots start zeroed, and the all-zero word must read as "no meaningful
// hash": `is_valid` is false for it even though the hash portion decodes
// to zero.

/// Number of bits used for the key hash.
pub(crate) const KEY_HASH_BITS: u32 = 32;

/// Number of bits used for the update counter.
pub(crate) const UPDATE_COUNTER_BITS: u32 = 31;

const HASH_MASK: u64 = (1 << KEY_HASH_BITS) - 1;
const COUNTER_SHIFT: u32 = KEY_HASH_BITS;
const COUNTER_MASK: u64 = (1 << UPDATE_COUNTER_BITS) - 1;
const VALID_BIT: u64 = 1 << (KEY_HASH_BITS + UPDATE_COUNTER_BITS);

/// A slot's packed `(hash, update counter, valid)` word.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct HashField(u64);

impl HashField {
    /// The word of an untouched slot. Decodes as not valid.
    pub const ZERO: HashField = HashField(0);

    /// Packs the three components into one word.
    ///
    /// The counter wraps modulo its bit width; wraparound is a rare, benign
    /// ABA window given the width.
    #[inline]
    pub const fn new(hash: u32, counter: u32, valid: bool) -> HashField {
        HashField(
            (hash as u64)
                | ((counter as u64 & COUNTER_MASK) << COUNTER_SHIFT)
                | if valid { VALID_BIT } else { 0 },
        )
    }

    /// Reconstructs a field from its raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> HashField {
        HashField(raw)
    }

    /// Returns the raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the key hash portion.
    #[inline]
    pub const fn hash(self) -> u32 {
        (self.0 & HASH_MASK) as u32
    }

    /// Returns the update counter portion.
    #[inline]
    pub const fn counter(self) -> u32 {
        ((self.0 >> COUNTER_SHIFT) & COUNTER_MASK) as u32
    }

    /// Returns `true` if the slot's hash is meaningful for comparison.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && self.0 & VALID_BIT != 0
    }

    /// The word that installs `hash` over this observed word: counter
    /// bumped, valid bit set.
    #[inline]
    pub const fn install(self, hash: u32) -> HashField {
        HashField::new(hash, self.counter().wrapping_add(1), true)
    }

    /// The word that retires this observed word: hash kept, counter bumped,
    /// valid bit cleared.
    #[inline]
    pub const fn invalidate(self) -> HashField {
        HashField::new(self.hash(), self.counter().wrapping_add(1), false)
    }
}

impl std::fmt::Debug for HashField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashField")
            .field("hash", &self.hash())
            .field("counter", &self.counter())
            .field("valid", &self.is_valid())
            .finish()
    }
}
