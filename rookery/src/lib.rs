//! Rookery: hazard-pointer memory reclamation for concurrent data structures.
//!
//! Readers publish the address of every object they are about to dereference
//! in a hazard slot; writers unlink objects and *retire* them instead of
//! freeing them. A retired object is freed by a later scan once no slot
//! publishes its address.
//!
//! # Key Features
//!
//! - **Per-object protection**: a reader pins exactly the objects it touches
//! - **Bounded garbage**: unreclaimed objects are bounded by the number of
//!   published hazards plus a constant per scan
//! - **Layout-free retirement**: any boxed object, or any pointer with a
//!   custom deleter, can be retired
//! - **Cascading release**: deleters may retire further objects, which is
//!   what reference-linked structures need
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicPtr, Ordering};
//! use rookery::{HazardPointer, default_domain};
//!
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(42u64)));
//!
//! // Reader side
//! let hazard = HazardPointer::new();
//! let ptr = hazard.protect(&shared);
//! assert_eq!(unsafe { *ptr }, 42);
//!
//! // Writer side: unlink, then retire
//! let old = shared.swap(Box::into_raw(Box::new(7)), Ordering::AcqRel);
//! unsafe { default_domain().retire(old) };
//!
//! // Still readable: the hazard keeps it alive
//! assert_eq!(unsafe { *ptr }, 42);
//! drop(hazard);
//!
//! default_domain().cleanup();
//! # unsafe { drop(Box::from_raw(shared.load(Ordering::Relaxed))) };
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod domain;
mod hazard;
mod reclaim;
mod retired;
mod slot;
mod ttas;

pub use domain::{HazardDomain, default_domain};
pub use hazard::{HazardArray, HazardPointer};
pub use retired::Deleter;

/// Retire a boxed object to the [`default_domain`].
///
/// # Safety
///
/// See [`HazardDomain::retire`].
#[inline]
pub unsafe fn retire<T: 'static>(ptr: *mut T) {
    unsafe { default_domain().retire(ptr) }
}

/// Run a reclamation barrier on the [`default_domain`].
///
/// Returns the number of objects freed.
#[inline]
pub fn cleanup() -> usize {
    default_domain().cleanup()
}

// Re-export for convenience
pub use core::sync::atomic::Ordering;
