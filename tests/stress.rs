mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use common::*;
use pitaya::EntryState;
use rand::prelude::*;

#[test]
fn concurrent_insert_and_lookup_disjoint_keys() {
    const PER_THREAD: usize = if cfg!(miri) { 8 } else { 128 };

    let threads = threads();
    let set = with_capacity(4096);
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads {
            let set = &set;
            let barrier = &barrier;
            s.spawn(move || {
                let guard = set.guard();
                barrier.wait();

                let start = (t * PER_THREAD) as u64;
                for key in start..start + PER_THREAD as u64 {
                    let hash = key as u32;
                    assert_eq!(insert(set, key, hash, &key.to_le_bytes(), &guard), Ok(true));
                }

                for key in start..start + PER_THREAD as u64 {
                    let hash = key as u32;
                    assert_eq!(
                        lookup(set, key, hash, &guard),
                        Some(key.to_le_bytes().to_vec())
                    );
                }
            });
        }
    });

    assert_eq!(set.entries(), threads * PER_THREAD);

    // No key ever observes another key's value.
    let guard = set.guard();
    for key in 0..(threads * PER_THREAD) as u64 {
        assert_eq!(
            lookup(&set, key, key as u32, &guard),
            Some(key.to_le_bytes().to_vec())
        );
    }
}

#[test]
fn concurrent_insert_of_the_same_key() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 64 };

    for _ in 0..ITERATIONS {
        let threads = threads();
        let set = with_capacity(64);
        let barrier = Barrier::new(threads);
        let wins = AtomicUsize::new(0);

        thread::scope(|s| {
            for t in 0..threads {
                let set = &set;
                let barrier = &barrier;
                let wins = &wins;
                s.spawn(move || {
                    let guard = set.guard();
                    let mut ctx = set.thread_context();
                    barrier.wait();

                    set.allocate_entry_and_write_key(&mut ctx, &7, slot_of(set, 3), 3, &guard)
                        .unwrap();

                    // Unless the value was already committed, compete to
                    // attach ours.
                    if ctx.entry_state() != EntryState::Valid {
                        set.write_value(&mut ctx, &t.to_le_bytes());
                        if set.link_value(&mut ctx, &guard) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        // One entry, one committed value.
        assert_eq!(set.entries(), 1);
        assert_eq!(wins.load(Ordering::Relaxed), 1);

        let guard = set.guard();
        assert!(lookup(&set, 7, 3, &guard).is_some());
    }
}

#[test]
fn concurrent_delete_completion_is_idempotent() {
    const KEYS: u64 = if cfg!(miri) { 8 } else { 64 };

    let set = with_capacity(256);
    {
        let guard = set.guard();
        for key in 0..KEYS {
            assert_eq!(insert(&set, key, key as u32, b"v", &guard), Ok(true));
        }
    }

    let threads = threads();
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for _ in 0..threads {
            let set = &set;
            let barrier = &barrier;
            s.spawn(move || {
                let guard = set.guard();

                // Observe every entry while it is still live.
                let mut ctxs = Vec::new();
                for key in 0..KEYS {
                    let mut ctx = set.thread_context();
                    assert!(set.look_up(
                        &mut ctx,
                        &key,
                        slot_of(set, key as u32),
                        key as u32,
                        &guard
                    ));
                    ctxs.push(ctx);
                }

                barrier.wait();

                // Every thread runs the whole deletion protocol for every
                // key; the slots must retire exactly once.
                for ctx in &mut ctxs {
                    set.mark_value_deleted(ctx, &guard);
                    set.delete_value_finish(ctx, &guard);
                }
            });
        }
    });

    // A double count decrement or double release would show up here as a
    // wrapped counter.
    assert_eq!(set.entries(), 0);
    assert_eq!(set.memory_size(), 0);

    let guard = set.guard();
    for key in 0..KEYS {
        assert_eq!(lookup(&set, key, key as u32, &guard), None);
    }
}

#[test]
fn insert_remove_churn() {
    const ROUNDS: usize = if cfg!(miri) { 2 } else { 16 };
    const PER_THREAD: u64 = if cfg!(miri) { 4 } else { 32 };

    let threads = threads();
    let set = with_capacity(512);
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads {
            let set = &set;
            let barrier = &barrier;
            s.spawn(move || {
                let guard = set.guard();
                let mut rng = rand::thread_rng();

                let start = t as u64 * PER_THREAD;
                let mut keys: Vec<u64> = (start..start + PER_THREAD).collect();

                barrier.wait();

                for _ in 0..ROUNDS {
                    keys.shuffle(&mut rng);

                    // Colliding initial slots across threads stress chain
                    // probing and deletion helping.
                    for &key in &keys {
                        let hash = (key % 97) as u32;
                        assert_eq!(
                            insert(set, key, hash, &key.to_le_bytes(), &guard),
                            Ok(true)
                        );
                    }

                    for &key in &keys {
                        let hash = (key % 97) as u32;
                        assert_eq!(
                            lookup(set, key, hash, &guard),
                            Some(key.to_le_bytes().to_vec())
                        );
                    }

                    for &key in &keys {
                        let hash = (key % 97) as u32;
                        assert!(remove(set, key, hash, &guard));
                    }

                    for &key in &keys {
                        let hash = (key % 97) as u32;
                        assert_eq!(lookup(set, key, hash, &guard), None);
                    }
                }
            });
        }
    });

    assert_eq!(set.entries(), 0);
    assert_eq!(set.memory_size(), 0);
}
