//! The key serialization boundary.

use std::cmp::Ordering;

/// Serializes typed keys into off-heap regions and compares typed keys
/// against serialized ones.
///
/// Implementations must be consistent: `compare(k, s)` is `Equal` exactly
/// when `s` is the serialized form of a key equal to `k`, and the ordering
/// must agree with the key type's own ordering for the comparisons to be
/// meaningful.
pub trait KeyCodec<K> {
    /// Appends the serialized form of `key` to `dst`.
    fn serialize(&self, key: &K, dst: &mut Vec<u8>);

    /// Compares a typed key with a serialized key.
    fn compare(&self, key: &K, serialized: &[u8]) -> Ordering;
}
