//! Entry management for off-heap concurrent hash maps.
//!
//! `pitaya` is the entry layer of a concurrent map that keeps its keys and
//! values outside the managed heap: a fixed-capacity, open-addressed
//! [`EntryHashSet`] whose slots hold word-sized [`Reference`]s into memory
//! owned by a [`MemoryManager`]. The set arbitrates concurrent insertion,
//! lookup, and deletion with per-word compare-and-swap, without locks, and
//! publishes and retires off-heap references through an epoch-style scope
//! so regions are never reclaimed under a concurrent reader.
//!
//! The set is a building block, not a map: key serialization, value
//! semantics, hashing, and the policy for replacing a table whose collision
//! chains are exhausted all belong to the caller.
//!
//! # Example
//!
//! ```
//! use std::cmp::Ordering;
//!
//! use pitaya::{EntryHashSet, HeapManager, KeyCodec};
//!
//! struct U64Codec;
//!
//! impl KeyCodec<u64> for U64Codec {
//!     fn serialize(&self, key: &u64, dst: &mut Vec<u8>) {
//!         dst.extend_from_slice(&key.to_le_bytes());
//!     }
//!
//!     fn compare(&self, key: &u64, serialized: &[u8]) -> Ordering {
//!         let mut raw = [0; 8];
//!         raw.copy_from_slice(serialized);
//!         key.cmp(&u64::from_le_bytes(raw))
//!     }
//! }
//!
//! let set = EntryHashSet::new(64, HeapManager::new(), U64Codec);
//! let guard = set.guard();
//!
//! let (key, hash) = (42u64, 7u32);
//! let idx = hash as usize % set.capacity();
//!
//! // Install the key, then attach a value.
//! let mut ctx = set.thread_context();
//! set.allocate_entry_and_write_key(&mut ctx, &key, idx, hash, &guard)?;
//! set.write_value(&mut ctx, b"value");
//! assert!(set.link_value(&mut ctx, &guard));
//!
//! let mut probe = set.thread_context();
//! assert!(set.look_up(&mut probe, &key, idx, hash, &guard));
//! assert_eq!(probe.value().bytes(), &b"value"[..]);
//! # Ok::<(), pitaya::Error>(())
//! ```

mod context;
mod entries;
mod error;
mod field;
mod memory;
mod serialize;
mod set;

pub use context::{EntryState, SliceBuffer, ThreadContext};
pub use error::Error;
pub use field::HashField;
pub use memory::{HeapManager, MemoryManager, Reference};
pub use serialize::KeyCodec;
pub use set::{EntryHashSet, DEFAULT_COLLISION_CHAIN, MAX_RETRIES};

pub use seize::Guard;
