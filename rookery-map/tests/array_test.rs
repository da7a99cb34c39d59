use rookery_map::{ArrayConfig, ArrayError, AtomicHashArray, QuadraticProbe};
use std::collections::HashSet;

#[test]
fn test_fill_erase_scenario() {
    let array: AtomicHashArray<u64, u64> =
        AtomicHashArray::create(4, ArrayConfig::default().with_max_load_factor(0.5)).unwrap();
    assert_eq!(array.capacity(), 8);
    assert_eq!(array.max_entries(), 4);

    for k in 1..=4 {
        assert!(array.insert(k, k).1);
    }
    let (entry, inserted) = array.insert(5, 5);
    assert!(!inserted);
    assert!(entry.is_none());

    assert!(array.erase(&2));
    assert!(array.find(&2).is_none());
    assert_eq!(array.len(), 3);
    assert_eq!(array.approx_len(), 3);
}

#[test]
fn test_erased_key_stays_out_of_non_full_array() {
    let array: AtomicHashArray<u64, &str> =
        AtomicHashArray::create(100, ArrayConfig::default()).unwrap();
    array.insert(1, "one");
    array.erase(&1);

    let (entry, inserted) = array.insert(1, "uno");
    assert!(entry.is_none());
    assert!(!inserted);
    assert!(array.insert(2, "two").1);
}

#[test]
fn test_string_keys() {
    let array: AtomicHashArray<String, Vec<u8>> =
        AtomicHashArray::create(16, ArrayConfig::default()).unwrap();
    array.insert("a".into(), vec![1]);
    let (_, inserted) = array.insert_by("b", || ("b".into(), vec![2, 2]));
    assert!(inserted);

    assert_eq!(array.find("a").unwrap().value(), &vec![1]);
    assert_eq!(array.find("b").unwrap().value().len(), 2);
    assert!(array.find("c").is_none());
}

#[test]
fn test_iteration_skips_erased() {
    let array: AtomicHashArray<u32, u32, foldhash::fast::FixedState, QuadraticProbe> =
        AtomicHashArray::create(100, ArrayConfig::default()).unwrap();
    for k in 0..50 {
        array.insert(k, k);
    }
    for k in (0..50).step_by(2) {
        array.erase(&k);
    }

    let keys: HashSet<u32> = array.iter().map(|e| *e.key()).collect();
    assert_eq!(keys.len(), 25);
    assert!(keys.iter().all(|k| k % 2 == 1));
    assert_eq!((&array).into_iter().count(), array.len());
}

#[test]
fn test_explicit_capacity_and_errors() {
    let array: AtomicHashArray<u64, u64> =
        AtomicHashArray::create(10, ArrayConfig::default().with_capacity(64)).unwrap();
    assert_eq!(array.capacity(), 64);
    assert_eq!(array.max_entries(), 51);
    assert_eq!(array.max_load_factor(), 0.8);

    assert!(matches!(
        AtomicHashArray::<u64, u64>::create(10, ArrayConfig::default().with_max_load_factor(0.0)),
        Err(ArrayError::InvalidLoadFactor(_))
    ));
    assert!(matches!(
        AtomicHashArray::<u64, u64>::create(0, ArrayConfig::default()),
        Err(ArrayError::ZeroCapacity)
    ));
}

#[test]
fn test_uncached_counters() {
    let array: AtomicHashArray<u64, u64> = AtomicHashArray::create(
        8,
        ArrayConfig::default().with_entry_count_thread_cache_size(0),
    )
    .unwrap();
    for k in 0..8 {
        array.insert(k, k);
    }
    assert_eq!(array.len(), 8);
    assert!(!array.insert(100, 0).1);
}
