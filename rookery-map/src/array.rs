//! Fixed-capacity lock-free hash array.
//!
//! # Architecture
//! - **Cells**: one boxed slice allocated by `create`, never resized. Each
//!   cell is a state byte plus uninitialised storage for `(K, V)`.
//! - **States**: `EMPTY -> LOCKED -> OCCUPIED -> ERASED`. A writer claims an
//!   empty cell by CAS to `LOCKED`, constructs the entry in place and
//!   publishes it with a Release store of `OCCUPIED`. Readers load the state
//!   with Acquire and only touch the entry once it reads `OCCUPIED`/`ERASED`.
//! - **Tombstones**: `ERASED` is terminal. The entry stays in place until the
//!   array is dropped or cleared, so references handed out earlier stay valid
//!   and the key can never be inserted again into the same array.
//! - **Fullness**: inserts stop once `max_entries` is reached. The last
//!   in-flight inserts are drained through a pending counter before the
//!   array is declared closed for good.

use crate::config::ArrayConfig;
use crate::counter::ThreadCachedCounter;
use crate::error::ArrayError;
use crate::probe::{LinearProbe, Probe};
use alloc::boxed::Box;
use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use crossbeam_utils::Backoff;
use foldhash::fast::FixedState;

const EMPTY: u8 = 0;
const LOCKED: u8 = 1;
const OCCUPIED: u8 = 2;
const ERASED: u8 = 3;

const NOT_FULL: u8 = 0;
const NO_NEW_INSERTS: u8 = 1;
const NO_PENDING_INSERTS: u8 = 2;

struct Cell<K, V> {
    state: AtomicU8,
    entry: UnsafeCell<MaybeUninit<(K, V)>>,
}

impl<K, V> Cell<K, V> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            entry: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// The state must have been observed (Acquire) as `OCCUPIED` or `ERASED`.
    #[inline(always)]
    unsafe fn entry(&self) -> &(K, V) {
        unsafe { (*self.entry.get()).assume_init_ref() }
    }

    /// Spin until the owner of a locked cell publishes or gives it back.
    fn wait_unlocked(&self) -> u8 {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state != LOCKED {
                return state;
            }
            backoff.snooze();
        }
    }
}

/// Outcome of the probe phase of an insert.
enum Claim {
    /// The cell at this index is `LOCKED` by the caller.
    Vacant(usize),
    /// An occupied cell already holds the key.
    Occupied(usize),
    /// Full, exhausted, or the key was erased.
    Rejected,
}

/// Gives a claimed cell back if constructing its entry unwinds.
struct ClaimGuard<'a> {
    state: &'a AtomicU8,
    pending: &'a ThreadCachedCounter,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.state.store(EMPTY, Ordering::Release);
        self.pending.decrement();
    }
}

/// A published entry of an [`AtomicHashArray`].
///
/// Borrowed from the array; the entry stays readable even if it is erased
/// concurrently.
pub struct EntryRef<'a, K, V> {
    index: usize,
    entry: &'a (K, V),
}

impl<'a, K, V> EntryRef<'a, K, V> {
    /// The key.
    #[inline]
    pub fn key(&self) -> &'a K {
        &self.entry.0
    }

    /// The value.
    #[inline]
    pub fn value(&self) -> &'a V {
        &self.entry.1
    }

    /// Cell index, usable with [`AtomicHashArray::find_at`].
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<K, V> Clone for EntryRef<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for EntryRef<'_, K, V> {}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for EntryRef<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("index", &self.index)
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}

/// Open-addressed hash table with a capacity fixed at creation.
///
/// Insert, find and erase are lock-free; the only waiting happens when a
/// probe runs into a cell whose owner is still constructing its entry.
/// Inserts fail with `(None, false)` instead of growing.
pub struct AtomicHashArray<K, V, S = FixedState, P = LinearProbe> {
    cells: Box<[Cell<K, V>]>,
    anchor_mask: usize,
    max_load_factor: f32,
    max_entries: usize,
    entries: ThreadCachedCounter,
    pending: ThreadCachedCounter,
    erases: AtomicUsize,
    full: AtomicU8,
    hasher: S,
    _probe: PhantomData<fn() -> P>,
}

impl<K, V, S, P> AtomicHashArray<K, V, S, P>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
    P: Probe,
{
    /// Creates an array able to hold at least `max_size` entries.
    ///
    /// Capacity is `config.capacity` if non-zero, otherwise the smallest
    /// value with `floor(capacity * max_load_factor) >= max_size`.
    pub fn create(max_size: usize, config: ArrayConfig) -> Result<Self, ArrayError> {
        Self::create_with_hasher(max_size, config, S::default())
    }
}

impl<K, V, S, P> AtomicHashArray<K, V, S, P>
where
    K: Hash + Eq,
    S: BuildHasher,
    P: Probe,
{
    /// [`create`](Self::create) with an explicit hasher.
    pub fn create_with_hasher(
        max_size: usize,
        config: ArrayConfig,
        hasher: S,
    ) -> Result<Self, ArrayError> {
        let lf = config.max_load_factor;
        if !(lf > 0.0 && lf <= 1.0) {
            return Err(ArrayError::InvalidLoadFactor(lf));
        }
        let lf = f64::from(lf);

        let capacity = if config.capacity != 0 {
            config.capacity
        } else {
            let mut capacity = (max_size as f64 / lf).ceil() as usize;
            while ((capacity as f64 * lf).floor() as usize) < max_size {
                capacity += 1;
            }
            capacity
        };
        if capacity == 0 {
            return Err(ArrayError::ZeroCapacity);
        }

        let max_entries = ((capacity as f64 * lf + 0.5).floor() as usize).min(capacity);
        let cells: Box<[Cell<K, V>]> = (0..capacity).map(|_| Cell::new()).collect();

        tracing::debug!(capacity, max_entries, "hash array created");

        Ok(Self {
            cells,
            anchor_mask: capacity.next_power_of_two() - 1,
            max_load_factor: config.max_load_factor,
            max_entries,
            entries: ThreadCachedCounter::new(config.entry_count_thread_cache_size),
            pending: ThreadCachedCounter::new(config.entry_count_thread_cache_size),
            erases: AtomicUsize::new(0),
            full: AtomicU8::new(NOT_FULL),
            hasher,
            _probe: PhantomData,
        })
    }

    #[inline(always)]
    fn anchor(&self, hash: u64) -> usize {
        let idx = (hash as usize) & self.anchor_mask;
        if idx < self.cells.len() {
            idx
        } else {
            (hash % self.cells.len() as u64) as usize
        }
    }

    #[inline(always)]
    fn entry_ref(&self, index: usize) -> EntryRef<'_, K, V> {
        EntryRef {
            index,
            // SAFETY: callers only pass indices observed as OCCUPIED; the
            // entry is never dropped while `self` is borrowed.
            entry: unsafe { self.cells[index].entry() },
        }
    }

    /// Inserts `key -> value` unless `key` is present.
    ///
    /// Returns the entry holding `key` and whether this call inserted it, or
    /// `(None, false)` when the array is full or `key` was erased.
    pub fn insert(&self, key: K, value: V) -> (Option<EntryRef<'_, K, V>>, bool) {
        self.insert_with(key, move || value)
    }

    /// Like [`insert`](Self::insert), but `make` only runs once an empty cell
    /// has been locked for the entry.
    ///
    /// If `make` panics the cell is handed back and the panic resumes.
    pub fn insert_with<F>(&self, key: K, make: F) -> (Option<EntryRef<'_, K, V>>, bool)
    where
        F: FnOnce() -> V,
    {
        let hash = self.hasher.hash_one(&key);
        match self.claim(hash, |k| *k == key) {
            Claim::Vacant(idx) => (Some(self.fill(idx, move || (key, make()))), true),
            Claim::Occupied(idx) => (Some(self.entry_ref(idx)), false),
            Claim::Rejected => (None, false),
        }
    }

    /// Insert looked up through a borrowed form of the key. The owned key is
    /// only built by `make` when a cell was claimed for it.
    pub fn insert_by<Q, F>(&self, key: &Q, make: F) -> (Option<EntryRef<'_, K, V>>, bool)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce() -> (K, V),
    {
        let hash = self.hasher.hash_one(key);
        match self.claim(hash, |k| Borrow::<Q>::borrow(k) == key) {
            Claim::Vacant(idx) => {
                let entry = self.fill(idx, || {
                    let entry = make();
                    debug_assert!(
                        Borrow::<Q>::borrow(&entry.0) == key,
                        "insert_by built a different key"
                    );
                    entry
                });
                (Some(entry), true)
            }
            Claim::Occupied(idx) => (Some(self.entry_ref(idx)), false),
            Claim::Rejected => (None, false),
        }
    }

    /// Probe phase of an insert. On `Vacant` the cell is locked and the
    /// pending counter holds one unit for the caller.
    fn claim(&self, hash: u64, eq: impl Fn(&K) -> bool) -> Claim {
        if self.full.load(Ordering::Acquire) == NO_PENDING_INSERTS {
            return Claim::Rejected;
        }

        let capacity = self.cells.len();
        let mut idx = self.anchor(hash);
        let mut probes = 0;

        loop {
            let cell = &self.cells[idx];
            let mut state = cell.state.load(Ordering::Acquire);

            if state == EMPTY {
                self.pending.increment();
                if self.full.load(Ordering::Acquire) != NOT_FULL {
                    self.pending.decrement();
                    self.drain_pending();
                    state = cell.state.load(Ordering::Acquire);
                    if state == EMPTY {
                        return Claim::Rejected;
                    }
                } else {
                    match cell.state.compare_exchange(
                        EMPTY,
                        LOCKED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Claim::Vacant(idx),
                        Err(actual) => {
                            self.pending.decrement();
                            state = actual;
                        }
                    }
                }
            }

            if state == LOCKED {
                state = cell.wait_unlocked();
                if state == EMPTY {
                    // Owner's constructor unwound; the cell is free again.
                    continue;
                }
            }

            // SAFETY: state is OCCUPIED or ERASED, both Acquire-observed.
            if eq(unsafe { &cell.entry().0 }) {
                return if state == OCCUPIED {
                    Claim::Occupied(idx)
                } else {
                    Claim::Rejected
                };
            }

            probes += 1;
            if probes >= capacity {
                return Claim::Rejected;
            }
            idx = P::next(idx, probes, capacity);
        }
    }

    /// Construct and publish the entry of a cell returned by `claim`.
    fn fill<F>(&self, idx: usize, make: F) -> EntryRef<'_, K, V>
    where
        F: FnOnce() -> (K, V),
    {
        let cell = &self.cells[idx];
        let guard = ClaimGuard {
            state: &cell.state,
            pending: &self.pending,
        };
        let entry = make();
        mem::forget(guard);

        // SAFETY: the cell is LOCKED by us, nobody else reads or writes it.
        let entry: &(K, V) = unsafe { (*cell.entry.get()).write(entry) };
        cell.state.store(OCCUPIED, Ordering::Release);

        self.entries.increment();
        self.pending.decrement();

        if self.entries.read_fast() >= self.max_entries as i64
            && self
                .full
                .compare_exchange(NOT_FULL, NO_NEW_INSERTS, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!(
                max_entries = self.max_entries,
                capacity = self.cells.len(),
                "hash array reached its entry limit"
            );
        }

        EntryRef { index: idx, entry }
    }

    /// Wait for in-flight inserts to finish, then close the array for good.
    fn drain_pending(&self) {
        let backoff = Backoff::new();
        while self.full.load(Ordering::Acquire) != NO_PENDING_INSERTS
            && self.pending.read_full() != 0
        {
            backoff.snooze();
        }
        self.full.store(NO_PENDING_INSERTS, Ordering::Release);
    }

    /// Looks up `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<EntryRef<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.locate(key)
            .and_then(|(idx, state)| (state == OCCUPIED).then(|| self.entry_ref(idx)))
    }

    /// Index and state of the cell that holds or held `key`.
    fn locate<Q>(&self, key: &Q) -> Option<(usize, u8)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        let capacity = self.cells.len();
        let mut idx = self.anchor(hash);

        for probes in 1..=capacity {
            let cell = &self.cells[idx];
            match cell.state.load(Ordering::Acquire) {
                EMPTY => return None,
                LOCKED => {}
                state => {
                    // SAFETY: OCCUPIED or ERASED, Acquire-observed.
                    if Borrow::<Q>::borrow(unsafe { &cell.entry().0 }) == key {
                        return Some((idx, state));
                    }
                }
            }
            if probes < capacity {
                idx = P::next(idx, probes, capacity);
            }
        }
        None
    }

    /// The entry at `index` if that cell currently holds one.
    pub fn find_at(&self, index: usize) -> Option<EntryRef<'_, K, V>> {
        let cell = self.cells.get(index)?;
        (cell.state.load(Ordering::Acquire) == OCCUPIED).then(|| self.entry_ref(index))
    }

    /// Tombstones `key`. Returns false if it was absent, still being
    /// inserted, or already erased.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some((idx, OCCUPIED)) = self.locate(key) else {
            return false;
        };
        let erased = self.cells[idx]
            .state
            .compare_exchange(OCCUPIED, ERASED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if erased {
            self.erases.fetch_add(1, Ordering::AcqRel);
        }
        erased
    }

    /// Returns an iterator over the live entries.
    ///
    /// Weakly consistent: entries inserted or erased during the walk may or
    /// may not be seen.
    pub fn iter(&self) -> Iter<'_, K, V, S, P> {
        Iter {
            array: self,
            index: 0,
        }
    }
}

impl<K, V, S, P> AtomicHashArray<K, V, S, P> {
    /// Number of live entries. Sums every counter stripe.
    pub fn len(&self) -> usize {
        let live = self.entries.read_full() - self.erases.load(Ordering::Acquire) as i64;
        live.max(0) as usize
    }

    /// Cheap estimate of [`len`](Self::len), exact when a single thread
    /// inserts.
    pub fn approx_len(&self) -> usize {
        let live = self.entries.read_fast() - self.erases.load(Ordering::Acquire) as i64;
        live.max(0) as usize
    }

    /// Returns true if the array holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cells.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Entry count at which inserts start failing.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Load factor the array was created with.
    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    /// Get the underlying hasher itself.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Drops every entry, tombstones included, and reopens the array.
    pub fn clear(&mut self) {
        self.drop_entries();
        self.entries.reset();
        self.pending.reset();
        *self.erases.get_mut() = 0;
        *self.full.get_mut() = NOT_FULL;
    }

    fn drop_entries(&mut self) {
        for cell in self.cells.iter_mut() {
            let state = cell.state.get_mut();
            if *state == OCCUPIED || *state == ERASED {
                // SAFETY: exclusive access and the entry is initialised.
                unsafe { cell.entry.get_mut().assume_init_drop() };
            }
            *state = EMPTY;
        }
    }
}

impl<K, V, S, P> Drop for AtomicHashArray<K, V, S, P> {
    fn drop(&mut self) {
        self.drop_entries();
    }
}

impl<K, V, S, P> fmt::Debug for AtomicHashArray<K, V, S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicHashArray")
            .field("capacity", &self.capacity())
            .field("max_entries", &self.max_entries)
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: entries are written once by the thread that locked their cell and
// published with Release; afterwards they are shared immutably until the
// array is dropped or cleared through `&mut`.
unsafe impl<K: Send, V: Send, S: Send, P> Send for AtomicHashArray<K, V, S, P> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, P> Sync for AtomicHashArray<K, V, S, P> {}

/// Iterator over the live entries of an [`AtomicHashArray`].
pub struct Iter<'a, K, V, S, P> {
    array: &'a AtomicHashArray<K, V, S, P>,
    index: usize,
}

impl<'a, K, V, S, P> Iterator for Iter<'a, K, V, S, P> {
    type Item = EntryRef<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(cell) = self.array.cells.get(self.index) {
            let index = self.index;
            self.index += 1;
            if cell.state.load(Ordering::Acquire) == OCCUPIED {
                return Some(EntryRef {
                    index,
                    // SAFETY: OCCUPIED, Acquire-observed, lives as long as 'a.
                    entry: unsafe { cell.entry() },
                });
            }
        }
        None
    }
}

impl<'a, K, V, S, P> IntoIterator for &'a AtomicHashArray<K, V, S, P>
where
    K: Hash + Eq,
    S: BuildHasher,
    P: Probe,
{
    type Item = EntryRef<'a, K, V>;
    type IntoIter = Iter<'a, K, V, S, P>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
