#![allow(dead_code)]

use std::cmp::Ordering;

use pitaya::{EntryHashSet, EntryState, HeapManager, KeyCodec, ThreadContext};
use seize::LocalGuard;

// Serializes `u64` keys little-endian.
pub struct U64Codec;

impl KeyCodec<u64> for U64Codec {
    fn serialize(&self, key: &u64, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&key.to_le_bytes());
    }

    fn compare(&self, key: &u64, serialized: &[u8]) -> Ordering {
        let mut raw = [0; 8];
        raw.copy_from_slice(serialized);
        key.cmp(&u64::from_le_bytes(raw))
    }
}

pub type Set = EntryHashSet<u64, U64Codec, HeapManager>;

pub fn with_capacity(capacity: usize) -> Set {
    EntryHashSet::new(capacity, HeapManager::new(), U64Codec)
}

pub fn slot_of(set: &Set, hash: u32) -> usize {
    hash as usize % set.capacity()
}

// Installs `key` and attaches `value`. Returns `Ok(false)` if the key
// already existed with a committed value.
pub fn insert(
    set: &Set,
    key: u64,
    hash: u32,
    value: &[u8],
    guard: &LocalGuard<'_>,
) -> Result<bool, pitaya::Error> {
    let mut ctx = set.thread_context();
    set.allocate_entry_and_write_key(&mut ctx, &key, slot_of(set, hash), hash, guard)?;

    if ctx.entry_state() == EntryState::Valid {
        return Ok(false);
    }

    set.write_value(&mut ctx, value);
    Ok(set.link_value(&mut ctx, guard))
}

pub fn lookup(set: &Set, key: u64, hash: u32, guard: &LocalGuard<'_>) -> Option<Vec<u8>> {
    let mut ctx = set.thread_context();
    if set.look_up(&mut ctx, &key, slot_of(set, hash), hash, guard) {
        Some(ctx.value().bytes().to_vec())
    } else {
        None
    }
}

// Runs the full deletion protocol for `key`: the off-heap linearization
// point followed by the bookkeeping.
pub fn remove(set: &Set, key: u64, hash: u32, guard: &LocalGuard<'_>) -> bool {
    let mut ctx = set.thread_context();
    if !set.look_up(&mut ctx, &key, slot_of(set, hash), hash, guard) {
        return false;
    }

    set.mark_value_deleted(&ctx, guard);
    set.delete_value_finish(&mut ctx, guard);
    true
}

// Marks `key`'s value deleted off-heap and returns without running the
// bookkeeping, leaving the entry half-deleted. The returned context can
// finish the deletion later.
pub fn mark_deleted(
    set: &Set,
    key: u64,
    hash: u32,
    guard: &LocalGuard<'_>,
) -> Option<ThreadContext> {
    let mut ctx = set.thread_context();
    if !set.look_up(&mut ctx, &key, slot_of(set, hash), hash, guard) {
        return None;
    }

    set.mark_value_deleted(&ctx, guard);
    Some(ctx)
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two().min(8)
    }
}
