//! Concurrent hash tables on top of rookery's hazard pointers.
//!
//! This crate provides two complementary tables:
//!
//! - [`AtomicHashArray`]: fixed capacity, open addressing, lock-free insert,
//!   find and erase. Never grows; inserts fail once it is full.
//! - [`ConcurrentHashMap`]: `2^SHARD_BITS` lazily created segments, each a
//!   bucket-chained map with one writer lock and lock-free readers.
//!
//! # Features
//!
//! - **Lock-Free Reads**: lookups never take a lock in either table
//! - **Stable References**: [`Ref`] keeps an entry alive through a hazard
//!   pointer even if it is erased or replaced concurrently
//! - **Cheap Counting**: [`ThreadCachedCounter`] keeps entry counts off the
//!   shared cache line
//! - **Flexible Hashing**: support for custom hash builders, FoldHash by
//!   default
//!
//! # Example
//!
//! ```rust
//! use rookery_map::{ArrayConfig, AtomicHashArray, ConcurrentHashMap};
//!
//! let map = ConcurrentHashMap::new();
//! map.insert(42, "hello").unwrap();
//! map.insert_or_assign(100, "world").unwrap();
//!
//! if let Some(value) = map.find(&42) {
//!     println!("Found: {}", *value);
//! }
//! map.erase(&42);
//!
//! let array: AtomicHashArray<u32, u32> =
//!     AtomicHashArray::create(100, ArrayConfig::default()).unwrap();
//! let (entry, inserted) = array.insert(7, 49);
//! assert!(inserted);
//! assert_eq!(*entry.unwrap().value(), 49);
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod array;
mod config;
mod counter;
mod error;
mod map;
mod probe;
mod segment;

pub use array::{AtomicHashArray, EntryRef, Iter as ArrayIter};
pub use config::{ArrayConfig, MapConfig};
pub use counter::ThreadCachedCounter;
pub use error::{ArrayError, MapError};
pub use map::{ConcurrentHashMap, Iter, Keys};
pub use probe::{LinearProbe, Probe, QuadraticProbe};
pub use segment::Ref;
