//! Sharded concurrent hash map.
//!
//! # Architecture
//! - **Shards**: `2^SHARD_BITS` segment pointers, null until the first write
//!   to that shard. Installation is a CAS race; the loser frees its segment.
//! - **Routing**: the low `SHARD_BITS` bits of the hash pick the shard, the
//!   bits above them pick the bucket inside the segment.
//! - **Concurrency**: writers lock one segment; readers are lock-free and
//!   hold hazard pointers on what they return.

use crate::config::MapConfig;
use crate::error::MapError;
use crate::segment::{Cursor, Ref, Segment};
use alloc::boxed::Box;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use foldhash::fast::FixedState;

/// Concurrent hash map split into independently locked segments.
///
/// Lookups return [`Ref`]s that keep the entry alive through hazard
/// pointers, so erasing or replacing an entry never invalidates a reader.
///
/// Unlinked entries are freed by whichever thread next reclaims the shared
/// hazard domain, so keys and values must be `Send`:
///
/// ```compile_fail
/// use rookery_map::ConcurrentHashMap;
/// use std::rc::Rc;
///
/// let map: ConcurrentHashMap<u64, Rc<u64>> = ConcurrentHashMap::new();
/// map.insert(1, Rc::new(1)).unwrap();
/// ```
pub struct ConcurrentHashMap<K, V, S = FixedState, const SHARD_BITS: u32 = 8> {
    segments: Box<[AtomicPtr<Segment<K, V>>]>,
    config: MapConfig,
    hasher: S,
}

impl<K, V> ConcurrentHashMap<K, V, FixedState, 8>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates an empty map with the default configuration.
    pub fn new() -> Self {
        Self::with_config(MapConfig::default(), FixedState::default())
    }

    /// Creates an empty map sized for `capacity` buckets.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(
            MapConfig::default().with_initial_size(capacity),
            FixedState::default(),
        )
    }
}

impl<K, V, S, const SHARD_BITS: u32> ConcurrentHashMap<K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    /// Number of shards.
    pub const NUM_SHARDS: usize = 1 << SHARD_BITS;

    /// Creates an empty map. No segment is allocated until the first write.
    pub fn with_config(config: MapConfig, hasher: S) -> Self {
        let config = MapConfig {
            initial_size: config.initial_size.next_power_of_two(),
            max_size: if config.max_size == 0 {
                0
            } else {
                config.max_size.next_power_of_two()
            },
            load_factor: config.load_factor,
        };
        let segments = (0..Self::NUM_SHARDS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            segments,
            config,
            hasher,
        }
    }

    /// Creates an empty map using the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_config(MapConfig::default(), hasher)
    }

    /// Effective configuration, sizes rounded to powers of two.
    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Get the underlying hasher itself.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    #[inline(always)]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline(always)]
    fn shard_of(hash: u64) -> usize {
        (hash as usize) & (Self::NUM_SHARDS - 1)
    }

    /// Shard that `key` lives in.
    pub fn shard_index<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        Self::shard_of(self.hash(key))
    }

    #[inline]
    fn segment(&self, shard: usize) -> Option<&Segment<K, V>> {
        // SAFETY: segments are only freed by `Drop`.
        unsafe { self.segments[shard].load(Ordering::Acquire).as_ref() }
    }

    fn ensure_segment(&self, shard: usize) -> &Segment<K, V> {
        if let Some(segment) = self.segment(shard) {
            return segment;
        }

        let per_segment_max = if self.config.max_size == 0 {
            0
        } else {
            (self.config.max_size >> SHARD_BITS).max(1)
        };
        let fresh = Box::into_raw(Box::new(Segment::new(
            self.config.initial_size >> SHARD_BITS,
            self.config.load_factor,
            per_segment_max,
            SHARD_BITS,
        )));

        match self.segments[shard].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!(shard, "segment created");
                // SAFETY: just installed, freed only by `Drop`.
                unsafe { &*fresh }
            }
            Err(winner) => {
                // SAFETY: never published.
                unsafe { drop(Box::from_raw(fresh)) };
                unsafe { &*winner }
            }
        }
    }

    /// Looks up `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<Ref<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment(Self::shard_of(hash))?.find(hash, key)
    }

    /// Clone of the value stored for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).map(|r| r.value().clone())
    }

    /// Like [`find`](Self::find), with a miss reported as an error.
    pub fn at<Q>(&self, key: &Q) -> Result<Ref<'_, K, V>, MapError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).ok_or(MapError::NotFound)
    }

    /// Checks if the key exists.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// `1` if `key` is present, else `0`.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        usize::from(self.contains_key(key))
    }

    /// Inserts `key -> value` unless `key` is present.
    ///
    /// Returns the entry now stored for `key` and whether this call created
    /// it. Fails only when the segment would have to grow past its share of
    /// `max_size`.
    pub fn insert(&self, key: K, value: V) -> Result<(Ref<'_, K, V>, bool), MapError> {
        self.try_emplace(key, move || value)
    }

    /// Same as [`insert`](Self::insert).
    pub fn emplace(&self, key: K, value: V) -> Result<(Ref<'_, K, V>, bool), MapError> {
        self.insert(key, value)
    }

    /// Inserts with a value built by `make`, which only runs if `key` is
    /// absent.
    pub fn try_emplace<F>(&self, key: K, make: F) -> Result<(Ref<'_, K, V>, bool), MapError>
    where
        F: FnOnce() -> V,
    {
        let hash = self.hash(&key);
        self.ensure_segment(Self::shard_of(hash))
            .insert(hash, key, make)
    }

    /// Inserts `key -> value`, replacing any previous value.
    pub fn insert_or_assign(&self, key: K, value: V) -> Result<Ref<'_, K, V>, MapError> {
        let hash = self.hash(&key);
        self.ensure_segment(Self::shard_of(hash))
            .insert_or_assign(hash, key, move || value)
    }

    /// Replaces the value of an existing entry. `None` if `key` is absent.
    pub fn assign(&self, key: K, value: V) -> Option<Ref<'_, K, V>> {
        let hash = self.hash(&key);
        self.segment(Self::shard_of(hash))?
            .assign(hash, key, value, |_| true)
    }

    /// Replaces the value of `key` only if it currently equals `expected`.
    pub fn assign_if_equal(&self, key: K, expected: &V, desired: V) -> Option<Ref<'_, K, V>>
    where
        V: PartialEq,
    {
        let hash = self.hash(&key);
        self.segment(Self::shard_of(hash))?
            .assign(hash, key, desired, |current| current == expected)
    }

    /// Removes `key`. Readers holding a [`Ref`] to it are unaffected.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        match self.segment(Self::shard_of(hash)) {
            Some(segment) => segment.erase(hash, key),
            None => false,
        }
    }

    /// Number of entries, summed over segments without a global lock.
    pub fn len(&self) -> usize {
        (0..Self::NUM_SHARDS)
            .filter_map(|shard| self.segment(shard))
            .map(Segment::len)
            .sum()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry. Segments stay allocated.
    pub fn clear(&self) {
        for segment in (0..Self::NUM_SHARDS).filter_map(|shard| self.segment(shard)) {
            segment.clear();
        }
    }

    /// Grows existing segments to fit `capacity` entries in total.
    pub fn reserve(&self, capacity: usize) {
        let per_segment = capacity >> SHARD_BITS;
        if per_segment == 0 {
            return;
        }
        for segment in (0..Self::NUM_SHARDS).filter_map(|shard| self.segment(shard)) {
            segment.reserve(per_segment);
        }
    }

    /// Sets the load factor of existing segments.
    pub fn set_max_load_factor(&self, load_factor: f32) {
        for segment in (0..Self::NUM_SHARDS).filter_map(|shard| self.segment(shard)) {
            segment.set_max_load_factor(load_factor);
        }
    }

    /// Returns an iterator over the map entries.
    /// Yields (K, V) clones.
    pub fn iter(&self) -> Iter<'_, K, V, S, SHARD_BITS> {
        Iter {
            map: self,
            shard: 0,
            cursor: None,
        }
    }

    /// Returns an iterator over the map keys.
    /// Yields K clones.
    pub fn keys(&self) -> Keys<'_, K, V, S, SHARD_BITS> {
        Keys { iter: self.iter() }
    }
}

impl<K, V, S, const SHARD_BITS: u32> Default for ConcurrentHashMap<K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_config(MapConfig::default(), S::default())
    }
}

impl<K, V, S, const SHARD_BITS: u32> Drop for ConcurrentHashMap<K, V, S, SHARD_BITS> {
    fn drop(&mut self) {
        for slot in self.segments.iter_mut() {
            let segment = *slot.get_mut();
            if !segment.is_null() {
                // SAFETY: `&mut self`, no reader or writer is left.
                unsafe { drop(Box::from_raw(segment)) };
            }
        }
    }
}

impl<K, V, S, const SHARD_BITS: u32> fmt::Debug for ConcurrentHashMap<K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentHashMap")
            .field("shards", &Self::NUM_SHARDS)
            .field("len", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

// SAFETY: entries are shared between threads and may be dropped by whichever
// thread reclaims them, hence both bounds on K and V for either trait.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send, const SHARD_BITS: u32> Send
    for ConcurrentHashMap<K, V, S, SHARD_BITS>
{
}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, const SHARD_BITS: u32> Sync
    for ConcurrentHashMap<K, V, S, SHARD_BITS>
{
}

/// Iterator over map entries, segment by segment.
///
/// Weakly consistent: concurrent inserts and erases may or may not be seen,
/// but every entry present for the whole walk is yielded exactly once.
pub struct Iter<'a, K, V, S, const SHARD_BITS: u32> {
    map: &'a ConcurrentHashMap<K, V, S, SHARD_BITS>,
    shard: usize,
    cursor: Option<Cursor<'a, K, V>>,
}

impl<'a, K, V, S, const SHARD_BITS: u32> Iterator for Iter<'a, K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.cursor.as_mut().and_then(Iterator::next) {
                return Some(item);
            }
            self.cursor = None;

            let map = self.map;
            while self.shard < ConcurrentHashMap::<K, V, S, SHARD_BITS>::NUM_SHARDS {
                let shard = self.shard;
                self.shard += 1;
                if let Some(segment) = map.segment(shard) {
                    self.cursor = Some(segment.cursor());
                    break;
                }
            }
            self.cursor.as_ref()?;
        }
    }
}

/// Iterator over map keys.
pub struct Keys<'a, K, V, S, const SHARD_BITS: u32> {
    iter: Iter<'a, K, V, S, SHARD_BITS>,
}

impl<'a, K, V, S, const SHARD_BITS: u32> Iterator for Keys<'a, K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(k, _)| k)
    }
}

impl<'a, K, V, S, const SHARD_BITS: u32> IntoIterator for &'a ConcurrentHashMap<K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S, SHARD_BITS>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    type SmallMap = ConcurrentHashMap<u64, u64, FixedState, 2>;

    #[test]
    fn test_insert_and_get() {
        let map = ConcurrentHashMap::new();
        let (r, inserted) = map.insert(1, 100).unwrap();
        assert!(inserted);
        assert_eq!(*r, 100);
        drop(r);
        assert_eq!(map.get(&1), Some(100));
        assert_eq!(map.get(&2), None);
    }

    #[test]
    fn test_insert_keeps_existing() {
        let map = ConcurrentHashMap::new();
        map.insert(1, 100).unwrap();
        let (r, inserted) = map.insert(1, 200).unwrap();
        assert!(!inserted);
        assert_eq!(*r, 100);
    }

    #[test]
    fn test_lazy_segments() {
        let map = SmallMap::default();
        assert!(map.segment(0).is_none());
        map.insert(4, 4).unwrap();
        assert!(map.segment(map.shard_index(&4)).is_some());
        assert_eq!(
            (0..SmallMap::NUM_SHARDS)
                .filter(|s| map.segment(*s).is_some())
                .count(),
            1
        );
    }

    #[test]
    fn test_at_reports_missing_key() {
        let map: ConcurrentHashMap<u64, u64> = ConcurrentHashMap::new();
        assert_eq!(map.at(&3).unwrap_err(), MapError::NotFound);
        map.insert(3, 30).unwrap();
        assert_eq!(*map.at(&3).unwrap(), 30);
        assert_eq!(map.count(&3), 1);
        assert_eq!(map.count(&4), 0);
    }

    #[test]
    fn test_config_rounding() {
        let map: ConcurrentHashMap<u64, u64, FixedState, 2> = ConcurrentHashMap::with_config(
            MapConfig::default().with_initial_size(100).with_max_size(1000),
            FixedState::default(),
        );
        assert_eq!(map.config().initial_size, 128);
        assert_eq!(map.config().max_size, 1024);
    }

    #[test]
    fn test_take_leaves_source_empty() {
        let mut map = SmallMap::default();
        for k in 0..10 {
            map.insert(k, k).unwrap();
        }
        let moved = core::mem::take(&mut map);
        assert_eq!(moved.len(), 10);
        assert!(map.is_empty());
        assert!(map.iter().next().is_none());
    }

    #[test]
    fn test_keys() {
        let map = SmallMap::default();
        for k in 0..16 {
            map.insert(k, k * k).unwrap();
        }
        let mut keys: Vec<u64> = map.keys().collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..16).collect::<Vec<_>>());
    }
}
