//! Reclamation scan.
//!
//! A scan snapshots every published hazard, frees each retired object whose
//! address is not in the snapshot, and hands the rest back as survivors.
//! Deleters run with the thread flagged as reclaiming so that objects they
//! retire in turn (cascading releases) are queued without starting a nested
//! scan.

use crate::retired::Retired;
use crate::slot::SlotRegistry;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{Ordering, fence};

std::thread_local! {
    static RECLAIMING: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is running deleters.
#[inline]
pub(crate) fn in_reclaim() -> bool {
    RECLAIMING.with(Cell::get)
}

/// Marks the thread as reclaiming until dropped. Restores the previous
/// state so nested scopes (cleanup inside a deleter) unwind correctly.
struct ReclaimScope {
    prev: bool,
}

impl ReclaimScope {
    fn enter() -> Self {
        Self {
            prev: RECLAIMING.with(|r| r.replace(true)),
        }
    }
}

impl Drop for ReclaimScope {
    fn drop(&mut self) {
        let prev = self.prev;
        RECLAIMING.with(|r| r.set(prev));
    }
}

/// Collect the currently published hazards, sorted for binary search.
fn snapshot(slots: &SlotRegistry) -> Vec<*mut ()> {
    // Pairs with the fence between publication and the validating reload in
    // HazardPointer::protect: either the reader's hazard is visible here, or
    // the reload observes the unlink that preceded retirement.
    fence(Ordering::SeqCst);
    let mut hazards: Vec<*mut ()> = slots
        .iter()
        .map(|slot| slot.ptr.load(Ordering::Acquire))
        .filter(|p| !p.is_null())
        .collect();
    hazards.sort_unstable();
    hazards.dedup();
    hazards
}

/// Free every unprotected object in `batch`.
///
/// Returns the protected survivors and the number of objects freed.
pub(crate) fn scan(slots: &SlotRegistry, batch: Vec<Retired>) -> (Vec<Retired>, usize) {
    let hazards = snapshot(slots);
    let mut survivors = Vec::new();
    let mut freed = 0usize;

    let _scope = ReclaimScope::enter();
    for retired in batch {
        if hazards.binary_search(&retired.ptr).is_ok() {
            survivors.push(retired);
        } else {
            // SAFETY: retired objects are unreachable for new readers, and no
            // existing reader published a hazard on it before the fence.
            unsafe { retired.reclaim() };
            freed += 1;
        }
    }

    (survivors, freed)
}

/// Free everything in `batch` without consulting hazards.
///
/// # Safety
///
/// No reader may hold a reference into any object of the batch.
pub(crate) unsafe fn reclaim_all(batch: Vec<Retired>) -> usize {
    let _scope = ReclaimScope::enter();
    let n = batch.len();
    for retired in batch {
        unsafe { retired.reclaim() };
    }
    n
}
