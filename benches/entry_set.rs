use std::cmp::Ordering;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use pitaya::{EntryHashSet, EntryState, HeapManager, KeyCodec};

struct U64Codec;

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

type Set = EntryHashSet<u64, U64Codec, HeapManager>;

fn insert(set: &Set, key: u64, hash: u32, value: &[u8], guard: &seize::LocalGuard<'_>) {
    let mut ctx = set.thread_context();
    set.allocate_entry_and_write_key(&mut ctx, &key, hash as usize % set.capacity(), hash, guard)
        .unwrap();
    if ctx.entry_state() != EntryState::Valid {
        set.write_value(&mut ctx, value);
        set.link_value(&mut ctx, guard);
    }
}

fn look_up(c: &mut Criterion) {
    const ENTRIES: u64 = 1 << 10;

    let set = EntryHashSet::new(1 << 16, HeapManager::new(), U64Codec);
    let guard = set.guard();

    for key in 0..ENTRIES {
        insert(&set, key, key as u32, &key.to_le_bytes(), &guard);
    }

    c.bench_function("look_up/hit", |b| {
        let mut ctx = set.thread_context();
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 1) & (ENTRIES - 1);
            let hash = key as u32;
            black_box(set.look_up(
                &mut ctx,
                &key,
                hash as usize % set.capacity(),
                hash,
                &guard,
            ))
        })
    });

    c.bench_function("look_up/miss", |b| {
        let mut ctx = set.thread_context();
        let mut key = ENTRIES;
        b.iter(|| {
            key += 1;
            let hash = key as u32;
            black_box(set.look_up(
                &mut ctx,
                &key,
                hash as usize % set.capacity(),
                hash,
                &guard,
            ))
        })
    });
}

fn insert_remove(c: &mut Criterion) {
    let set = EntryHashSet::new(1 << 16, HeapManager::new(), U64Codec);

    c.bench_function("insert_remove", |b| {
        let guard = set.guard();
        let mut key = 0u64;
        b.iter(|| {
            key += 1;
            let hash = key as u32;
            let idx = hash as usize % set.capacity();

            insert(&set, key, hash, &key.to_le_bytes(), &guard);

            let mut ctx = set.thread_context();
            assert!(set.look_up(&mut ctx, &key, idx, hash, &guard));
            set.mark_value_deleted(&ctx, &guard);
            set.delete_value_finish(&mut ctx, &guard);
        })
    });
}

criterion_group!(benches, look_up, insert_remove);
criterion_main!(benches);
