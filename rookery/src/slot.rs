//! Hazard slots and the per-domain slot registry.
//!
//! A slot is one published pointer. Slots live in an append-only, lock-free
//! singly linked list owned by the domain: they are claimed by flipping
//! `active`, handed back by clearing it, and only freed when the domain
//! itself is dropped. Scanners walk the whole list without synchronising
//! with claimers.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;

/// Retired objects tolerated per domain before a scan is attempted.
pub(crate) const RETIRE_THRESHOLD: usize = 64;

/// Extra retired objects tolerated per registered slot. Keeps the amortised
/// cost of a scan constant when many slots pin survivors.
pub(crate) const RETIRE_PER_SLOT: usize = 2;

/// One published hazard pointer.
pub(crate) struct HazardSlot {
    /// Pointer currently protected by the owner, null when idle.
    pub(crate) ptr: AtomicPtr<()>,
    /// Claimed by a live `HazardPointer`.
    active: AtomicBool,
    /// Next slot in the registry (immutable once published).
    next: *mut CachePadded<HazardSlot>,
}

impl HazardSlot {
    fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            next: ptr::null_mut(),
        }
    }

    #[inline]
    fn try_claim(&self) -> bool {
        !self.active.load(Ordering::Relaxed)
            && self
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Publish `p`. SeqCst pairs with the fence a scanner issues before it
    /// snapshots the registry.
    #[inline]
    pub(crate) fn publish(&self, p: *mut ()) {
        self.ptr.store(p, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn clear(&self) {
        self.ptr.store(ptr::null_mut(), Ordering::Release);
    }

    /// Hand the slot back to the registry.
    #[inline]
    pub(crate) fn release(&self) {
        self.clear();
        self.active.store(false, Ordering::Release);
    }
}

/// Append-only registry of hazard slots.
pub(crate) struct SlotRegistry {
    head: AtomicPtr<CachePadded<HazardSlot>>,
    len: AtomicUsize,
}

impl SlotRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Claim an idle slot, growing the registry when every slot is busy.
    pub(crate) fn acquire(&self) -> &HazardSlot {
        for slot in self.iter() {
            if slot.try_claim() {
                return slot;
            }
        }

        let fresh = Box::into_raw(Box::new(CachePadded::new(HazardSlot::new())));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `fresh` is not yet shared.
            unsafe { (&mut *fresh).next = head };
            match self
                .head
                .compare_exchange_weak(head, fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        // SAFETY: slots are only freed when the registry is dropped.
        unsafe { &*fresh }
    }

    /// Number of slots ever created.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn iter(&self) -> SlotIter<'_> {
        SlotIter {
            next: self.head.load(Ordering::Acquire),
            _registry: self,
        }
    }
}

impl Drop for SlotRegistry {
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            // SAFETY: exclusive access, every slot came from Box::into_raw.
            let slot = unsafe { Box::from_raw(curr) };
            curr = slot.next;
        }
    }
}

pub(crate) struct SlotIter<'a> {
    next: *mut CachePadded<HazardSlot>,
    _registry: &'a SlotRegistry,
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = &'a HazardSlot;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: published slots are immutable in `next` and live as long
        // as the registry.
        let slot: &'a HazardSlot = unsafe { &*self.next };
        self.next = slot.next;
        Some(slot)
    }
}

// SAFETY: slots are shared through atomics only; `next` is written before
// the slot is published and never again.
unsafe impl Send for SlotRegistry {}
unsafe impl Sync for SlotRegistry {}
