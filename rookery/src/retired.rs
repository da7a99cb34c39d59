//! Retired object records.
//!
//! Unlike an intrusive node, a record is kept on the side: retiring does not
//! require any particular layout of the retired type, only a deleter that
//! knows how to free it.

use alloc::boxed::Box;

/// Type-erased deleter. Receives the pointer that was retired.
pub type Deleter = unsafe fn(*mut ());

/// An object waiting for every hazard on it to clear.
pub(crate) struct Retired {
    pub(crate) ptr: *mut (),
    deleter: Deleter,
}

impl Retired {
    #[inline]
    pub(crate) fn new(ptr: *mut (), deleter: Deleter) -> Self {
        Self { ptr, deleter }
    }

    /// Run the deleter.
    ///
    /// # Safety
    ///
    /// No hazard may still protect `self.ptr`, and the record must not be
    /// reclaimed twice.
    #[inline]
    pub(crate) unsafe fn reclaim(self) {
        unsafe { (self.deleter)(self.ptr) }
    }
}

// SAFETY: retire() requires the retired object to be safe to drop on any thread.
unsafe impl Send for Retired {}

/// Deleter for objects allocated with `Box::new`.
///
/// # Safety
///
/// `ptr` must come from `Box::<T>::into_raw` and not be freed elsewhere.
pub(crate) unsafe fn drop_box<T>(ptr: *mut ()) {
    unsafe { drop(Box::from_raw(ptr.cast::<T>())) }
}
