//! `HazardPointer`: an owned hazard slot.
//!
//! The protect protocol is the classic one:
//! 1. load the source pointer
//! 2. publish it in the slot (SeqCst)
//! 3. reload the source; if it still holds the same pointer, the object
//!    was reachable after publication and cannot be reclaimed until the slot
//!    is cleared, otherwise retry with the new value.

use crate::domain::{HazardDomain, default_domain};
use crate::slot::HazardSlot;
use core::fmt;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering, fence};

/// Owns one hazard slot of a domain for its whole lifetime.
///
/// A `HazardPointer` protects at most one object at a time. Re-protecting
/// drops the previous protection. Dropping the value clears the slot and
/// returns it to the domain.
pub struct HazardPointer<'d> {
    domain: &'d HazardDomain,
    slot: &'d HazardSlot,
}

impl HazardPointer<'static> {
    /// Claims a slot in the [`default_domain`].
    #[inline]
    pub fn new() -> Self {
        Self::new_in(default_domain())
    }
}

impl Default for HazardPointer<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d> HazardPointer<'d> {
    /// Claims a slot in `domain`.
    #[inline]
    pub fn new_in(domain: &'d HazardDomain) -> Self {
        Self {
            domain,
            slot: domain.acquire_slot(),
        }
    }

    /// The domain this hazard pointer publishes into.
    #[inline]
    pub fn domain(&self) -> &'d HazardDomain {
        self.domain
    }

    /// Loads `src` and protects the loaded pointer.
    ///
    /// On return the pointee, if non-null, stays allocated until this hazard
    /// pointer is reset, re-protected or dropped, provided every writer
    /// unlinks objects from `src` before retiring them to the same domain.
    #[inline]
    pub fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            self.slot.publish(ptr.cast());
            fence(Ordering::SeqCst);
            let reloaded = src.load(Ordering::Acquire);
            if reloaded == ptr {
                return ptr;
            }
            ptr = reloaded;
        }
    }

    /// Single protection attempt.
    ///
    /// Protects `*ptr` and returns true if `src` still holds it; otherwise
    /// stores the newer value in `*ptr`, clears the slot and returns false.
    #[inline]
    pub fn try_protect<T>(&self, ptr: &mut *mut T, src: &AtomicPtr<T>) -> bool {
        let expected = *ptr;
        self.slot.publish(expected.cast());
        fence(Ordering::SeqCst);
        let reloaded = src.load(Ordering::Acquire);
        if reloaded == expected {
            true
        } else {
            self.slot.clear();
            *ptr = reloaded;
            false
        }
    }

    /// Publishes `ptr` without validation.
    ///
    /// Only sound when the caller otherwise knows `ptr` cannot be retired
    /// before the publication is visible, e.g. while holding the lock that
    /// every unlinker of `ptr` must take.
    #[inline]
    pub fn reset_protection<T>(&self, ptr: *const T) {
        self.slot.publish(ptr.cast_mut().cast());
    }

    /// Drops the current protection.
    #[inline]
    pub fn reset(&self) {
        self.slot.clear();
    }

    /// The pointer currently protected, null if none.
    #[inline]
    pub fn protected(&self) -> *mut () {
        self.slot.ptr.load(Ordering::Relaxed)
    }

    /// Exchanges the slots, and therefore the protections, of two hazard
    /// pointers of the same domain. Used for hand-over-hand traversal.
    #[inline]
    pub fn swap(&mut self, other: &mut HazardPointer<'d>) {
        debug_assert!(
            ptr::eq(self.domain, other.domain),
            "swapping hazard pointers across domains"
        );
        mem::swap(&mut self.slot, &mut other.slot);
    }
}

impl Drop for HazardPointer<'_> {
    #[inline]
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl fmt::Debug for HazardPointer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardPointer")
            .field("protected", &self.protected())
            .finish()
    }
}

/// Fixed group of hazard pointers claimed together.
pub struct HazardArray<'d, const N: usize> {
    hazards: [HazardPointer<'d>; N],
}

impl<const N: usize> HazardArray<'static, N> {
    /// Claims `N` slots in the [`default_domain`].
    pub fn new() -> Self {
        Self::new_in(default_domain())
    }
}

impl<const N: usize> Default for HazardArray<'static, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d, const N: usize> HazardArray<'d, N> {
    /// Claims `N` slots in `domain`.
    pub fn new_in(domain: &'d HazardDomain) -> Self {
        Self {
            hazards: core::array::from_fn(|_| HazardPointer::new_in(domain)),
        }
    }

    /// Exchanges the protections held at `a` and `b`.
    #[inline]
    pub fn swap(&mut self, a: usize, b: usize) {
        self.hazards.swap(a, b);
    }
}

impl<'d, const N: usize> core::ops::Index<usize> for HazardArray<'d, N> {
    type Output = HazardPointer<'d>;

    #[inline]
    fn index(&self, index: usize) -> &HazardPointer<'d> {
        &self.hazards[index]
    }
}

impl<'d, const N: usize> core::ops::IndexMut<usize> for HazardArray<'d, N> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut HazardPointer<'d> {
        &mut self.hazards[index]
    }
}
