//! Hazard-pointer domains.

use crate::reclaim;
use crate::retired::{Deleter, Retired, drop_box};
use crate::slot::{HazardSlot, RETIRE_PER_SLOT, RETIRE_THRESHOLD, SlotRegistry};
use crate::ttas::TTas;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A set of hazard slots together with the objects retired against them.
///
/// Objects retired to a domain are only freed once no hazard pointer of the
/// *same* domain protects them. Most users share [`default_domain`].
pub struct HazardDomain {
    slots: SlotRegistry,
    retired: TTas<Vec<Retired>>,
    retired_count: AtomicUsize,
}

static DEFAULT_DOMAIN: HazardDomain = HazardDomain::new();

/// The process-wide domain.
#[inline]
pub fn default_domain() -> &'static HazardDomain {
    &DEFAULT_DOMAIN
}

impl HazardDomain {
    /// Creates an empty domain.
    pub const fn new() -> Self {
        Self {
            slots: SlotRegistry::new(),
            retired: TTas::new(Vec::new()),
            retired_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn acquire_slot(&self) -> &HazardSlot {
        self.slots.acquire()
    }

    /// Number of hazard slots ever created in this domain.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of retired objects not reclaimed yet.
    pub fn retired_len(&self) -> usize {
        self.retired_count.load(Ordering::Relaxed)
    }

    /// Retire a boxed object.
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `Box::<T>::into_raw`.
    /// - `ptr` must already be unreachable for readers that have not
    ///   protected it yet (unlinked from every shared location).
    /// - `ptr` must not be retired twice.
    /// - `T` must be safe to drop on any thread (`T: Send`). The object is
    ///   freed by whichever thread reclaims it.
    #[inline]
    pub unsafe fn retire<T: 'static>(&self, ptr: *mut T) {
        unsafe { self.retire_with(ptr.cast(), drop_box::<T>) }
    }

    /// Retire an object with a custom deleter.
    ///
    /// The deleter runs on whichever thread reclaims the object, possibly
    /// after this call returns. It may retire further objects.
    ///
    /// # Safety
    ///
    /// Same contract as [`retire`](Self::retire), with `deleter` being the
    /// correct way to free `ptr`. Everything `deleter` drops must be `Send`.
    pub unsafe fn retire_with(&self, ptr: *mut (), deleter: Deleter) {
        debug_assert!(!ptr.is_null(), "retiring a null pointer");
        // The count only moves under the list lock, so a concurrent scan
        // never subtracts a record before it has been counted.
        let count = {
            let mut retired = self.retired.lock();
            retired.push(Retired::new(ptr, deleter));
            self.retired_count.fetch_add(1, Ordering::Relaxed) + 1
        };

        if count >= self.threshold() && !reclaim::in_reclaim() {
            self.scan();
        }
    }

    #[inline]
    fn threshold(&self) -> usize {
        RETIRE_THRESHOLD + RETIRE_PER_SLOT * self.slots.len()
    }

    /// One reclamation pass over everything retired so far.
    fn scan(&self) -> usize {
        let batch = {
            let mut retired = self.retired.lock();
            let batch = mem::take(&mut *retired);
            self.retired_count.fetch_sub(batch.len(), Ordering::Relaxed);
            batch
        };
        if batch.is_empty() {
            return 0;
        }
        let taken = batch.len();

        let (survivors, freed) = reclaim::scan(&self.slots, batch);

        let kept = survivors.len();
        if kept > 0 {
            let mut retired = self.retired.lock();
            retired.extend(survivors);
            self.retired_count.fetch_add(kept, Ordering::Relaxed);
        }
        tracing::trace!(taken, freed, kept, "hazard scan");
        freed
    }

    /// Reclamation barrier.
    ///
    /// Scans until every retired object is freed or everything left is still
    /// protected. Objects retired by deleters during the barrier are included.
    /// Returns the number of objects freed.
    pub fn cleanup(&self) -> usize {
        let mut total = 0;
        loop {
            let freed = self.scan();
            total += freed;
            if freed == 0 || self.retired_len() == 0 {
                break;
            }
        }
        tracing::debug!(freed = total, pending = self.retired_len(), "hazard cleanup");
        total
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // Hazard pointers borrow the domain, so none can be alive here.
        loop {
            let batch = mem::take(self.retired.get_mut());
            if batch.is_empty() {
                break;
            }
            // SAFETY: no reader of this domain is left.
            unsafe { reclaim::reclaim_all(batch) };
        }
    }
}
