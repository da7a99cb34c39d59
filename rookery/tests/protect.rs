//! Protection protocol tests.
//!
//! A writer swaps the shared pointer and retires the old object while
//! readers keep protecting and dereferencing it. Every object carries a
//! canary that its destructor poisons, so a reader that dereferences a freed
//! or reused object fails the canary check.

use rookery::{HazardArray, HazardDomain, HazardPointer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::thread;

const ALIVE: u64 = 0xA11C_E5A1_1CE5_A11C;
const DEAD: u64 = 0xDEAD_DEAD_DEAD_DEAD;

struct Canary {
    magic: AtomicU64,
    value: u64,
}

impl Canary {
    fn new(value: u64) -> *mut Self {
        Box::into_raw(Box::new(Self {
            magic: AtomicU64::new(ALIVE),
            value,
        }))
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.magic.store(DEAD, Ordering::SeqCst);
    }
}

#[test]
fn test_protect_returns_current() {
    let domain = HazardDomain::new();
    let shared = AtomicPtr::new(Canary::new(1));
    let hazard = HazardPointer::new_in(&domain);

    let ptr = hazard.protect(&shared);
    assert_eq!(ptr, shared.load(Ordering::Relaxed));
    assert_eq!(hazard.protected(), ptr.cast());

    hazard.reset();
    assert!(hazard.protected().is_null());
    unsafe { drop(Box::from_raw(ptr)) };
}

#[test]
fn test_try_protect_reports_change() {
    let domain = HazardDomain::new();
    let first = Canary::new(1);
    let second = Canary::new(2);
    let shared = AtomicPtr::new(first);
    let hazard = HazardPointer::new_in(&domain);

    let mut seen = first;
    shared.store(second, Ordering::Release);
    assert!(!hazard.try_protect(&mut seen, &shared));
    assert_eq!(seen, second);
    assert!(hazard.try_protect(&mut seen, &shared));
    assert_eq!(hazard.protected(), second.cast());

    drop(hazard);
    unsafe {
        drop(Box::from_raw(first));
        drop(Box::from_raw(second));
    }
}

#[test]
fn test_swap_exchanges_protection() {
    let domain = HazardDomain::new();
    let a = AtomicPtr::new(Canary::new(1));
    let b = AtomicPtr::new(Canary::new(2));

    let mut ha = HazardPointer::new_in(&domain);
    let mut hb = HazardPointer::new_in(&domain);
    let pa = ha.protect(&a);
    let pb = hb.protect(&b);
    ha.swap(&mut hb);
    assert_eq!(ha.protected(), pb.cast());
    assert_eq!(hb.protected(), pa.cast());

    let mut array: HazardArray<'_, 2> = HazardArray::new_in(&domain);
    array[0].protect(&a);
    array[1].protect(&b);
    array.swap(0, 1);
    assert_eq!(array[0].protected(), pb.cast());

    drop((ha, hb, array));
    unsafe {
        drop(Box::from_raw(pa));
        drop(Box::from_raw(pb));
    }
}

#[test]
fn test_slots_are_reused() {
    let domain = HazardDomain::new();
    for _ in 0..100 {
        let hazard = HazardPointer::new_in(&domain);
        drop(hazard);
    }
    assert_eq!(domain.slot_count(), 1);

    let held: Vec<_> = (0..4).map(|_| HazardPointer::new_in(&domain)).collect();
    assert_eq!(domain.slot_count(), 4);
    drop(held);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_never_see_freed_objects() {
    let domain = Arc::new(HazardDomain::new());
    let shared = Arc::new(AtomicPtr::new(Canary::new(0)));
    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let domain = domain.clone();
            let shared = shared.clone();
            let stop = stop.clone();
            let reads = reads.clone();
            thread::spawn(move || {
                let hazard = HazardPointer::new_in(&domain);
                while !stop.load(Ordering::Relaxed) {
                    let ptr = hazard.protect(&shared);
                    let canary = unsafe { &*ptr };
                    assert_eq!(canary.magic.load(Ordering::SeqCst), ALIVE);
                    std::hint::black_box(canary.value);
                    hazard.reset();
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    while reads.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }
    for i in 1..=20_000 {
        let old = shared.swap(Canary::new(i), Ordering::AcqRel);
        unsafe { domain.retire(old) };
    }
    stop.store(true, Ordering::Relaxed);

    for r in readers {
        r.join().unwrap();
    }
    assert!(reads.load(Ordering::Relaxed) > 0);

    domain.cleanup();
    assert_eq!(domain.retired_len(), 0);
    unsafe { drop(Box::from_raw(shared.load(Ordering::Relaxed))) };
}
