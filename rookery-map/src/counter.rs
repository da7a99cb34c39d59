//! Approximate concurrent counters.
//!
//! `ThreadCachedCounter` splits a counter into a shared total plus a set of
//! cache-padded stripes. Every thread owns one stripe (threads beyond the
//! stripe count share) and only touches the shared total once its stripe has
//! drifted `cache_size` away from zero. Reads come in two flavours:
//!
//! - [`read_fast`](ThreadCachedCounter::read_fast): shared total plus the
//!   caller's own stripe. Two loads, exact when a single thread writes.
//! - [`read_full`](ThreadCachedCounter::read_full): shared total plus every
//!   stripe. Exact once writers are quiescent, costs a pass over all stripes.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use portable_atomic::AtomicI64;

/// Number of stripes per counter.
const STRIPES: usize = 32;

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static STRIPE: usize = NEXT_THREAD.fetch_add(1, Ordering::Relaxed) % STRIPES;
}

#[inline]
fn stripe_index() -> usize {
    STRIPE.with(|s| *s)
}

/// Striped counter with a cheap and an exact read.
pub struct ThreadCachedCounter {
    global: CachePadded<AtomicI64>,
    stripes: Box<[CachePadded<AtomicI64>]>,
    cache_size: i64,
}

impl ThreadCachedCounter {
    /// Creates a zeroed counter. `cache_size == 0` disables caching and
    /// every update goes straight to the shared total.
    pub fn new(cache_size: u32) -> Self {
        Self {
            global: CachePadded::new(AtomicI64::new(0)),
            stripes: (0..STRIPES)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
            cache_size: i64::from(cache_size),
        }
    }

    /// Flush threshold of a stripe.
    pub fn cache_size(&self) -> u32 {
        self.cache_size as u32
    }

    /// Adds `delta` (may be negative).
    #[inline]
    pub fn add(&self, delta: i64) {
        if self.cache_size == 0 {
            self.global.fetch_add(delta, Ordering::AcqRel);
            return;
        }

        let stripe = &self.stripes[stripe_index()];
        let local = stripe.fetch_add(delta, Ordering::Relaxed) + delta;
        if local.abs() >= self.cache_size {
            // Publish before withdrawing: a racing read_full may count the
            // amount twice for a moment, never zero times. Each flusher
            // withdraws exactly what it published, so concurrent flushes of a
            // shared stripe keep the sum exact.
            self.global.fetch_add(local, Ordering::AcqRel);
            stripe.fetch_sub(local, Ordering::Relaxed);
        }
    }

    /// Adds one.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtracts one.
    #[inline]
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Shared total plus the calling thread's stripe.
    #[inline]
    pub fn read_fast(&self) -> i64 {
        let global = self.global.load(Ordering::Acquire);
        if self.cache_size == 0 {
            return global;
        }
        global + self.stripes[stripe_index()].load(Ordering::Relaxed)
    }

    /// Shared total plus every stripe.
    pub fn read_full(&self) -> i64 {
        let mut sum = self.global.load(Ordering::Acquire);
        for stripe in self.stripes.iter() {
            sum += stripe.load(Ordering::Acquire);
        }
        sum
    }

    /// Zeroes the counter.
    pub fn reset(&mut self) {
        *self.global.get_mut() = 0;
        for stripe in self.stripes.iter_mut() {
            *stripe.get_mut() = 0;
        }
    }
}

impl core::fmt::Debug for ThreadCachedCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadCachedCounter")
            .field("value", &self.read_full())
            .field("cache_size", &self.cache_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_thread_reads_agree() {
        let counter = ThreadCachedCounter::new(1000);
        for _ in 0..10 {
            counter.increment();
        }
        counter.decrement();
        assert_eq!(counter.read_fast(), 9);
        assert_eq!(counter.read_full(), 9);
    }

    #[test]
    fn test_flush_crosses_cache_size() {
        let counter = ThreadCachedCounter::new(4);
        for _ in 0..9 {
            counter.increment();
        }
        assert_eq!(counter.read_full(), 9);
        assert!(counter.global.load(Ordering::Relaxed) >= 8);
    }

    #[test]
    fn test_uncached_counter() {
        let counter = ThreadCachedCounter::new(0);
        counter.add(5);
        counter.add(-2);
        assert_eq!(counter.global.load(Ordering::Relaxed), 3);
        assert_eq!(counter.read_fast(), 3);
    }

    #[test]
    fn test_reset() {
        let mut counter = ThreadCachedCounter::new(16);
        counter.add(100);
        counter.reset();
        assert_eq!(counter.read_full(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_full_read_is_exact() {
        let counter = Arc::new(ThreadCachedCounter::new(7));
        let mut handles = vec![];
        for _ in 0..8 {
            let c = counter.clone();
            handles.push(thread::spawn(move || {
                for i in 0..10_000 {
                    if i % 4 == 0 {
                        c.decrement();
                    } else {
                        c.increment();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.read_full(), 8 * 5_000);
    }
}
