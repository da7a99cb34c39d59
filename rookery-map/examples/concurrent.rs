//! Example demonstrating concurrent operations on both tables
//!
//! Multiple threads insert, read, replace and erase entries of a
//! `ConcurrentHashMap`, then fill an `AtomicHashArray` until it refuses new
//! keys.

use rookery_map::{ArrayConfig, AtomicHashArray, ConcurrentHashMap, MapConfig};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Concurrent Hash Map Demo ===\n");

    let map: Arc<ConcurrentHashMap<u64, u64>> = Arc::new(ConcurrentHashMap::with_config(
        MapConfig::default().with_initial_size(4096),
        Default::default(),
    ));

    // Benchmark concurrent inserts
    println!("Benchmarking concurrent inserts...");
    let start = Instant::now();
    let mut handles = Vec::new();

    // Spawn 8 threads, each inserting 10,000 elements
    for thread_id in 0..8u64 {
        let map_clone = Arc::clone(&map);
        let handle = thread::spawn(move || {
            for i in 0..10_000 {
                let key = thread_id * 10_000 + i;
                map_clone.insert(key, key * 2).expect("unbounded map");
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Inserted 80,000 entries from 8 threads in {:?} ({:.2} ops/sec)",
        duration,
        80_000.0 / duration.as_secs_f64()
    );
    println!("Map contains {} entries\n", map.len());

    // Mixed readers, replacers and erasers
    println!("Benchmarking mixed concurrent operations...");
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..4 {
        let map_clone = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut found = 0;
            for key in 0..20_000u64 {
                if let Some(entry) = map_clone.find(&key) {
                    // The entry stays valid even if erased right now.
                    assert_eq!(*entry.key(), key);
                    found += 1;
                }
            }
            found
        }));
    }

    for thread_id in 0..2u64 {
        let map_clone = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..5_000 {
                let key = 10_000 + thread_id * 5_000 + i;
                map_clone
                    .insert_or_assign(key, key * 3)
                    .expect("unbounded map");
            }
            0
        }));
    }

    for thread_id in 0..2u64 {
        let map_clone = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..2_500 {
                let key = thread_id * 2_500 + i;
                map_clone.erase(&key);
            }
            0
        }));
    }

    let total_found: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let duration = start.elapsed();
    println!("Mixed operations completed in {:?}", duration);
    println!("Readers saw {} entries", total_found);
    println!("Final map size: {} entries\n", map.len());

    // Verify some data
    println!("Verifying data integrity...");
    let verified = (5_000..10_000u64)
        .filter(|key| map.get(key) == Some(key * 2))
        .count();
    let replaced = (10_000..20_000u64)
        .filter(|key| map.get(key) == Some(key * 3))
        .count();
    println!("Verified {} original and {} replaced values", verified, replaced);

    println!("\n=== Atomic Hash Array Demo ===\n");

    let array: Arc<AtomicHashArray<u64, u64>> = Arc::new(
        AtomicHashArray::create(
            10_000,
            ArrayConfig::default().with_max_load_factor(0.5),
        )
        .expect("valid config"),
    );
    println!(
        "Capacity {} cells, accepts {} entries",
        array.capacity(),
        array.max_entries()
    );

    let handles: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let array = Arc::clone(&array);
            thread::spawn(move || {
                (0..5_000u64)
                    .filter(|i| array.insert(thread_id * 5_000 + i, *i).1)
                    .count()
            })
        })
        .collect();
    let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    println!("Inserted {} of 20,000 keys before the array filled up", inserted);
    println!("Array holds {} entries", array.len());

    println!("\n=== Demo Complete ===");
}
