//! One shard of a [`ConcurrentHashMap`](crate::ConcurrentHashMap).
//!
//! # Architecture
//! - **Buckets**: boxed slice of chain heads, power-of-two sized. Replaced
//!   wholesale on rehash or clear; the old slice is retired to the hazard
//!   domain.
//! - **Nodes**: immutable once linked, except `next` of a chain predecessor
//!   while a writer holds the segment lock.
//! - **Links**: every node counts the bucket slots and nodes pointing at it.
//!   A node is retired when its count drops to zero, and reclaiming it
//!   releases the link it holds on its successor. An unlinked node therefore
//!   keeps its tail alive for any reader still walking through it.
//! - **Readers** never lock: they protect the bucket slice, then walk the
//!   chain hand over hand with two hazard pointers.

use crate::error::MapError;
use alloc::boxed::Box;
use core::borrow::Borrow;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use parking_lot::Mutex;
use rookery::{HazardArray, HazardPointer, default_domain};

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    next: AtomicPtr<Node<K, V>>,
    links: AtomicUsize,
}

impl<K, V> Node<K, V> {
    /// Allocates a node holding one link, to be stored by the caller.
    /// Takes over whatever link the caller owns on `next`.
    fn alloc(hash: u64, key: K, value: V, next: *mut Node<K, V>) -> *mut Self {
        Box::into_raw(Box::new(Node {
            hash,
            key,
            value,
            next: AtomicPtr::new(next),
            links: AtomicUsize::new(1),
        }))
    }

    /// # Safety
    ///
    /// `node` is null or points to a live node the caller already reaches
    /// through a counted link or the segment lock.
    unsafe fn acquire_link(node: *mut Self) {
        if let Some(node) = unsafe { node.as_ref() } {
            node.links.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops one link; retires the node when it was the last.
    ///
    /// # Safety
    ///
    /// The caller owns one link on `node` and gives it up.
    unsafe fn release(node: *mut Self) {
        if let Some(n) = unsafe { node.as_ref() } {
            if n.links.fetch_sub(1, Ordering::AcqRel) == 1 {
                unsafe { default_domain().retire_with(node.cast(), reclaim_node::<K, V>) };
            }
        }
    }
}

unsafe fn reclaim_node<K, V>(ptr: *mut ()) {
    let node = unsafe { Box::from_raw(ptr.cast::<Node<K, V>>()) };
    let next = node.next.load(Ordering::Acquire);
    drop(node);
    unsafe { Node::release(next) };
}

struct Buckets<K, V> {
    slots: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Buckets<K, V> {
    fn alloc(count: usize) -> *mut Self {
        debug_assert!(count.is_power_of_two());
        let slots = (0..count).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Box::into_raw(Box::new(Buckets { slots }))
    }

    #[inline]
    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Hands the chain head links back.
    ///
    /// # Safety
    ///
    /// The slice is no longer reachable by writers.
    unsafe fn release_heads(&self) {
        for slot in self.slots.iter() {
            unsafe { Node::release(slot.load(Ordering::Acquire)) };
        }
    }
}

unsafe fn reclaim_buckets<K, V>(ptr: *mut ()) {
    let buckets = unsafe { Box::from_raw(ptr.cast::<Buckets<K, V>>()) };
    unsafe { buckets.release_heads() };
}

/// Writer-side bookkeeping, only touched under the segment lock.
struct WriterState {
    load_factor: f32,
    load_factor_nodes: usize,
    max_size: usize,
}

/// Hazard-protected reference to a map entry.
///
/// The entry stays readable while the `Ref` lives, even if it is erased or
/// replaced concurrently; it then shows the value it had when found.
pub struct Ref<'a, K, V> {
    hazard: HazardPointer<'static>,
    node: NonNull<Node<K, V>>,
    _map: PhantomData<&'a (K, V)>,
}

impl<'a, K, V> Ref<'a, K, V> {
    fn new(hazard: HazardPointer<'static>, node: *mut Node<K, V>) -> Option<Self> {
        Some(Self {
            hazard,
            node: NonNull::new(node)?,
            _map: PhantomData,
        })
    }

    /// The key.
    #[inline]
    pub fn key(&self) -> &K {
        // SAFETY: protected by `self.hazard` since construction.
        unsafe { &self.node.as_ref().key }
    }

    /// The value.
    #[inline]
    pub fn value(&self) -> &V {
        // SAFETY: protected by `self.hazard` since construction.
        unsafe { &self.node.as_ref().value }
    }

    /// Key and value.
    #[inline]
    pub fn pair(&self) -> (&K, &V) {
        (self.key(), self.value())
    }
}

impl<K, V> Deref for Ref<'_, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Ref<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("key", self.key())
            .field("value", self.value())
            .field("hazard", &self.hazard)
            .finish()
    }
}

/// Bucket-chained hash map shard: one mutex for writers, lock-free readers.
pub(crate) struct Segment<K, V> {
    buckets: AtomicPtr<Buckets<K, V>>,
    size: AtomicUsize,
    shard_bits: u32,
    state: Mutex<WriterState>,
}

impl<K, V> Segment<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// `initial_buckets` is rounded up to a power of two; `max_size == 0`
    /// means unbounded.
    pub(crate) fn new(
        initial_buckets: usize,
        load_factor: f32,
        max_size: usize,
        shard_bits: u32,
    ) -> Self {
        let count = initial_buckets.next_power_of_two();
        Self {
            buckets: AtomicPtr::new(Buckets::alloc(count)),
            size: AtomicUsize::new(0),
            shard_bits,
            state: Mutex::new(WriterState {
                load_factor,
                load_factor_nodes: nodes_for(count, load_factor),
                max_size,
            }),
        }
    }

    #[inline(always)]
    fn bucket_index(&self, hash: u64, count: usize) -> usize {
        ((hash >> self.shard_bits) as usize) & (count - 1)
    }

    /// Current buckets. Stable while the lock is held.
    #[inline]
    fn locked_buckets(&self) -> &Buckets<K, V> {
        // SAFETY: only lock holders replace or retire the slice.
        unsafe { &*self.buckets.load(Ordering::Acquire) }
    }

    /// Number of entries.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of buckets.
    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        let _state = self.state.lock();
        self.locked_buckets().len()
    }

    /// Lock-free lookup.
    pub(crate) fn find<Q>(&self, hash: u64, key: &Q) -> Option<Ref<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let buckets_hazard = HazardPointer::new();
        // SAFETY: never null; protected until `buckets_hazard` drops.
        let buckets = unsafe { &*buckets_hazard.protect(&self.buckets) };
        let slot = &buckets.slots[self.bucket_index(hash, buckets.len())];

        let mut hazard = HazardPointer::new();
        let mut next_hazard = HazardPointer::new();
        let mut node = hazard.protect(slot);

        while let Some(n) = unsafe { node.as_ref() } {
            if n.hash == hash && n.key.borrow() == key {
                return Ref::new(hazard, node);
            }
            let next = next_hazard.protect(&n.next);
            hazard.swap(&mut next_hazard);
            node = next;
        }
        None
    }

    /// Link `(link, node)` for `key` in the current buckets, node null when
    /// absent. Lock must be held.
    fn locate<Q>(&self, hash: u64, key: &Q) -> (&AtomicPtr<Node<K, V>>, *mut Node<K, V>)
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let buckets = self.locked_buckets();
        let mut link = &buckets.slots[self.bucket_index(hash, buckets.len())];
        let mut node = link.load(Ordering::Acquire);

        while let Some(n) = unsafe { node.as_ref() } {
            if n.hash == hash && n.key.borrow() == key {
                return (link, node);
            }
            link = &n.next;
            node = n.next.load(Ordering::Acquire);
        }
        (link, ptr::null_mut())
    }

    /// Push a fresh node at the head of its bucket. Lock must be held.
    fn link_new(&self, hash: u64, key: K, value: V) -> *mut Node<K, V> {
        let buckets = self.locked_buckets();
        let slot = &buckets.slots[self.bucket_index(hash, buckets.len())];
        // The slot's link on the old head moves to the new node.
        let node = Node::alloc(hash, key, value, slot.load(Ordering::Acquire));
        slot.store(node, Ordering::Release);
        self.size.fetch_add(1, Ordering::Relaxed);
        node
    }

    /// Swap `old` for a copy with a new value. Lock must be held and `link`
    /// must currently point at `old`.
    fn replace(
        &self,
        link: &AtomicPtr<Node<K, V>>,
        old: *mut Node<K, V>,
        key: K,
        value: V,
    ) -> *mut Node<K, V> {
        // SAFETY: `old` is linked and we hold the lock.
        let old_ref = unsafe { &*old };
        let next = old_ref.next.load(Ordering::Acquire);
        unsafe { Node::acquire_link(next) };
        let node = Node::alloc(old_ref.hash, key, value, next);
        link.store(node, Ordering::Release);
        // SAFETY: `link` held one link on `old`.
        unsafe { Node::release(old) };
        node
    }

    /// Rehash when the next insert would pass the load factor.
    fn grow_if_needed(&self, state: &mut WriterState) -> Result<(), MapError> {
        let size = self.len();
        if size < state.load_factor_nodes {
            return Ok(());
        }
        if state.max_size != 0 && size * 2 > state.max_size {
            tracing::warn!(
                size,
                max_size = state.max_size,
                "segment refused to grow past its maximum size"
            );
            return Err(MapError::CapacityExceeded {
                max_size: state.max_size,
            });
        }
        let count = self.locked_buckets().len() * 2;
        self.rehash(state, count);
        Ok(())
    }

    /// Insert unless present. `make` runs only when a node is linked.
    pub(crate) fn insert<F>(
        &self,
        hash: u64,
        key: K,
        make: F,
    ) -> Result<(Ref<'_, K, V>, bool), MapError>
    where
        K: Eq,
        F: FnOnce() -> V,
    {
        let hazard = HazardPointer::new();
        let mut state = self.state.lock();
        self.grow_if_needed(&mut state)?;

        let (_, existing) = self.locate(hash, &key);
        let (node, inserted) = if existing.is_null() {
            (self.link_new(hash, key, make()), true)
        } else {
            (existing, false)
        };
        hazard.reset_protection(node.cast_const());
        drop(state);
        Ok((Ref::new(hazard, node).ok_or(MapError::NotFound)?, inserted))
    }

    /// Insert or replace.
    pub(crate) fn insert_or_assign<F>(
        &self,
        hash: u64,
        key: K,
        make: F,
    ) -> Result<Ref<'_, K, V>, MapError>
    where
        K: Eq,
        F: FnOnce() -> V,
    {
        let hazard = HazardPointer::new();
        let mut state = self.state.lock();

        let (link, existing) = self.locate(hash, &key);
        let node = if existing.is_null() {
            self.grow_if_needed(&mut state)?;
            self.link_new(hash, key, make())
        } else {
            let value = make();
            self.replace(link, existing, key, value)
        };
        hazard.reset_protection(node.cast_const());
        drop(state);
        Ref::new(hazard, node).ok_or(MapError::NotFound)
    }

    /// Replace the value of an existing entry if `matches` accepts the
    /// current one.
    pub(crate) fn assign<M>(&self, hash: u64, key: K, value: V, matches: M) -> Option<Ref<'_, K, V>>
    where
        K: Eq,
        M: FnOnce(&V) -> bool,
    {
        let hazard = HazardPointer::new();
        let state = self.state.lock();

        let (link, existing) = self.locate(hash, &key);
        // SAFETY: linked, lock held.
        let current = unsafe { existing.as_ref() }?;
        if !matches(&current.value) {
            return None;
        }
        let node = self.replace(link, existing, key, value);
        hazard.reset_protection(node.cast_const());
        drop(state);
        Ref::new(hazard, node)
    }

    /// Unlink `key`. Readers holding it keep a valid copy.
    pub(crate) fn erase<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _state = self.state.lock();
        let (link, node) = self.locate(hash, key);
        // SAFETY: linked, lock held.
        let Some(n) = (unsafe { node.as_ref() }) else {
            return false;
        };
        let next = n.next.load(Ordering::Acquire);
        unsafe { Node::acquire_link(next) };
        link.store(next, Ordering::Release);
        self.size.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: `link` held one link on `node`.
        unsafe { Node::release(node) };
        true
    }

    /// Rebuild into `count` buckets if that grows the table.
    ///
    /// The longest tail of each chain that lands in a single new bucket is
    /// shared with the old chain; nodes ahead of it are copied.
    fn rehash(&self, state: &mut WriterState, count: usize) {
        let count = count.next_power_of_two();
        let old_ptr = self.buckets.load(Ordering::Acquire);
        // SAFETY: lock held.
        let old = unsafe { &*old_ptr };
        let old_count = old.len();
        if count <= old_count {
            return;
        }

        let new_ptr = Buckets::<K, V>::alloc(count);
        // SAFETY: freshly allocated, not yet shared.
        let new = unsafe { &*new_ptr };

        for slot in old.slots.iter() {
            let head = slot.load(Ordering::Acquire);
            let Some(head_ref) = (unsafe { head.as_ref() }) else {
                continue;
            };

            let mut last_run = head;
            let mut last_idx = self.bucket_index(head_ref.hash, count);
            let mut node = head_ref.next.load(Ordering::Acquire);
            while let Some(n) = unsafe { node.as_ref() } {
                let idx = self.bucket_index(n.hash, count);
                if idx != last_idx {
                    last_idx = idx;
                    last_run = node;
                }
                node = n.next.load(Ordering::Acquire);
            }

            unsafe { Node::acquire_link(last_run) };
            new.slots[last_idx].store(last_run, Ordering::Relaxed);

            let mut node = head;
            while node != last_run {
                // SAFETY: every node ahead of `last_run` is linked.
                let n = unsafe { &*node };
                let target = &new.slots[self.bucket_index(n.hash, count)];
                let copy = Node::alloc(
                    n.hash,
                    n.key.clone(),
                    n.value.clone(),
                    target.load(Ordering::Relaxed),
                );
                target.store(copy, Ordering::Relaxed);
                node = n.next.load(Ordering::Acquire);
            }
        }

        self.buckets.store(new_ptr, Ordering::Release);
        state.load_factor_nodes = nodes_for(count, state.load_factor);
        // SAFETY: unreachable for new readers and writers.
        unsafe { default_domain().retire_with(old_ptr.cast(), reclaim_buckets::<K, V>) };

        tracing::debug!(from = old_count, to = count, size = self.len(), "segment rehash");
    }

    /// Grow so that `entries` fit without another rehash.
    pub(crate) fn reserve(&self, entries: usize) {
        let mut state = self.state.lock();
        if entries > state.load_factor_nodes {
            let count = (entries as f64 / f64::from(state.load_factor)).ceil() as usize + 1;
            self.rehash(&mut state, count);
        }
    }

    /// Change the load factor; takes effect on the next insert.
    pub(crate) fn set_max_load_factor(&self, load_factor: f32) {
        let mut state = self.state.lock();
        state.load_factor = load_factor;
        state.load_factor_nodes = nodes_for(self.locked_buckets().len(), load_factor);
    }

    /// Drop every entry, keeping the bucket count.
    pub(crate) fn clear(&self) {
        let _state = self.state.lock();
        let count = self.locked_buckets().len();
        let old_ptr = self.buckets.swap(Buckets::alloc(count), Ordering::AcqRel);
        let removed = self.size.swap(0, Ordering::Relaxed);
        // SAFETY: swapped out under the lock.
        unsafe { default_domain().retire_with(old_ptr.cast(), reclaim_buckets::<K, V>) };
        tracing::debug!(removed, buckets = count, "segment cleared");
    }

    /// Walks the segment, yielding clones.
    pub(crate) fn cursor(&self) -> Cursor<'_, K, V> {
        let hazards = HazardArray::new();
        let buckets = hazards[0].protect(&self.buckets);
        Cursor {
            hazards,
            buckets,
            bucket: 0,
            node: ptr::null_mut(),
            _segment: PhantomData,
        }
    }
}

fn nodes_for(count: usize, load_factor: f32) -> usize {
    (count as f64 * f64::from(load_factor)) as usize
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        let buckets = unsafe { Box::from_raw(*self.buckets.get_mut()) };
        // SAFETY: `&mut self`, nobody else reaches the slice. Nodes still
        // protected elsewhere are reclaimed later by the domain.
        unsafe { buckets.release_heads() };
    }
}

// SAFETY: nodes are shared across threads and may be dropped by whichever
// thread reclaims them.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Segment<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Segment<K, V> {}

/// Weakly consistent walk over one segment.
pub(crate) struct Cursor<'a, K, V> {
    /// `[0]` buckets, `[1]` current node, `[2]` next node.
    hazards: HazardArray<'static, 3>,
    buckets: *mut Buckets<K, V>,
    bucket: usize,
    node: *mut Node<K, V>,
    _segment: PhantomData<&'a Segment<K, V>>,
}

impl<K: Clone, V: Clone> Iterator for Cursor<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            // SAFETY: protected by hazards[1].
            if let Some(node) = unsafe { self.node.as_ref() } {
                let item = (node.key.clone(), node.value.clone());
                self.node = self.hazards[2].protect(&node.next);
                self.hazards.swap(1, 2);
                return Some(item);
            }

            // SAFETY: protected by hazards[0].
            let buckets = unsafe { &*self.buckets };
            let slot = buckets.slots.get(self.bucket)?;
            self.bucket += 1;
            self.node = self.hazards[1].protect(slot);
        }
    }
}
