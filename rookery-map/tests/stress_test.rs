use foldhash::fast::FixedState;
use rand::Rng;
use rookery_map::{ArrayConfig, AtomicHashArray, ConcurrentHashMap};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn test_map_heavy_contention_same_key() {
    let map = Arc::new(ConcurrentHashMap::new());

    let mut handles = vec![];
    for t in 0..8u64 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..5000 {
                m.insert_or_assign(0, t * 5000 + i).unwrap();
                let _ = m.get(&0);
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert!(map.get(&0).is_some());
    assert_eq!(map.len(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_map_concurrent_insert_erase_cycle() {
    let map = Arc::new(ConcurrentHashMap::new());

    let mut handles = vec![];
    for t in 0..4u64 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..2000 {
                let key = t * 2000 + i;
                m.insert(key, key).unwrap();
                if i % 2 == 0 {
                    assert!(m.erase(&key));
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 4000);
    for t in 0..4u64 {
        for i in 0..2000 {
            let key = t * 2000 + i;
            assert_eq!(map.contains_key(&key), i % 2 == 1);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_map_read_heavy_during_growth() {
    let map = Arc::new(ConcurrentHashMap::new());

    for i in 0..1000u64 {
        map.insert(i, i * 2).unwrap();
    }

    let mut handles = vec![];

    for _ in 0..8 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..10_000u64 {
                let key = i % 1000;
                assert_eq!(m.get(&key), Some(key * 2));
            }
        }));
    }

    // One writer forcing rehashes
    {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 1000..20_000u64 {
                m.insert(i, i * 2).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.len(), 20_000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_map_refs_stay_valid_under_churn() {
    let map: Arc<ConcurrentHashMap<u64, Vec<u64>, FixedState, 2>> =
        Arc::new(ConcurrentHashMap::default());
    for k in 0..64 {
        map.insert(k, vec![k; 8]).unwrap();
    }
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let m = map.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while !stop.load(Ordering::Relaxed) {
                    let key = rng.gen_range(0..64);
                    if let Some(entry) = m.find(&key) {
                        assert_eq!(*entry.key(), key);
                        assert_eq!(entry.len(), 8);
                        assert!(entry.iter().all(|v| *v % 64 == key));
                    }
                }
            })
        })
        .collect();

    let writer = {
        let m = map.clone();
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for round in 0..20_000u64 {
                let key = rng.gen_range(0..64);
                match round % 4 {
                    0 => {
                        m.erase(&key);
                    }
                    1 => {
                        m.insert_or_assign(key, vec![key + 64 * (round % 7); 8]).unwrap();
                    }
                    2 => {
                        m.insert(key, vec![key; 8]).unwrap();
                    }
                    _ => {
                        if round % 1000 == 3 {
                            m.clear();
                        }
                    }
                }
            }
        })
    };

    writer.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_map_iter_during_mutation() {
    let map = Arc::new(ConcurrentHashMap::new());

    for i in 0..100u64 {
        map.insert(i, i).unwrap();
    }

    let m = map.clone();
    let writer = thread::spawn(move || {
        for i in 100..2000u64 {
            m.insert(i, i).unwrap();
        }
    });

    // Entries present for the whole walk are seen exactly once
    let entries: Vec<(u64, u64)> = map.iter().collect();
    let keys: HashSet<u64> = entries.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys.len(), entries.len());
    assert!((0..100).all(|k| keys.contains(&k)));

    writer.join().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_array_concurrent_fill_never_exceeds_limit() {
    let array: Arc<AtomicHashArray<u64, u64>> = Arc::new(
        AtomicHashArray::create(1000, ArrayConfig::default().with_max_load_factor(0.5)).unwrap(),
    );

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let array = array.clone();
            thread::spawn(move || {
                let mut won = 0usize;
                for i in 0..1000u64 {
                    let key = t * 1000 + i;
                    let (entry, inserted) = array.insert(key, key);
                    if inserted {
                        assert_eq!(*entry.unwrap().value(), key);
                        won += 1;
                    }
                }
                won
            })
        })
        .collect();

    let won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(won, array.len());
    assert!(won >= array.max_entries());
    assert!(won <= array.capacity());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_array_erase_find_race() {
    let array: Arc<AtomicHashArray<u64, String>> =
        Arc::new(AtomicHashArray::create(4096, ArrayConfig::default()).unwrap());
    for k in 0..2048u64 {
        array.insert(k, k.to_string());
    }

    let finder = {
        let array = array.clone();
        thread::spawn(move || {
            for _ in 0..4 {
                for k in 0..2048u64 {
                    if let Some(entry) = array.find(&k) {
                        assert_eq!(entry.value(), &k.to_string());
                    }
                }
            }
        })
    };
    let eraser = {
        let array = array.clone();
        thread::spawn(move || (0..2048u64).filter(|k| array.erase(k)).count())
    };

    finder.join().unwrap();
    assert_eq!(eraser.join().unwrap(), 2048);
    assert!(array.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_array_concurrent_distinct_keys_all_fit() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 1000;
    let total = (THREADS * PER_THREAD) as usize;

    let array: Arc<AtomicHashArray<u64, u64>> = Arc::new(
        AtomicHashArray::create(total, ArrayConfig::default().with_max_load_factor(0.8)).unwrap(),
    );
    assert!(array.max_entries() >= total);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let array = array.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .filter(|i| {
                        let key = t * PER_THREAD + i;
                        array.insert(key, key * 2).1
                    })
                    .count()
            })
        })
        .collect();

    let won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(won, total);
    assert_eq!(array.len(), total);
    for key in 0..total as u64 {
        assert_eq!(*array.find(&key).unwrap().value(), key * 2);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_map_len_bounded_during_churn() {
    const WRITERS: u64 = 4;
    const KEYS_PER_WRITER: u64 = 250;
    let live_max = (WRITERS * KEYS_PER_WRITER) as usize;

    let map: Arc<ConcurrentHashMap<u64, u64>> = Arc::new(ConcurrentHashMap::new());
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let map = map.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut polls = 0usize;
            while !done.load(Ordering::Acquire) {
                let len = map.len();
                assert!(len <= live_max, "len {len} above {live_max} live keys");
                polls += 1;
            }
            polls
        })
    };

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..20_000 {
                    let key = t * KEYS_PER_WRITER + rng.gen_range(0..KEYS_PER_WRITER);
                    if rng.gen_bool(0.5) {
                        map.insert_or_assign(key, key).unwrap();
                    } else {
                        map.erase(&key);
                    }
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    let live = (0..live_max as u64).filter(|k| map.contains_key(k)).count();
    assert_eq!(map.len(), live);
}
