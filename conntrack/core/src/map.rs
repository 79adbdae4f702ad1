//! Fixed-capacity hash tables
//!
//! `FixedMap` models a preallocated kernel hash map. Every element is
//! allocated when the map is created and threaded onto a free list; inserts
//! pop from the free list and never allocate. Keys hash into a power-of-two
//! bucket array, each bucket protected by a spin lock that is only ever
//! *tried* a bounded number of times. A caller that cannot get the lock gets
//! [`MapError::Busy`] and is expected to drop its update and count it.
//!
//! Values are stored as atomic mirrors of plain records (see [`MapValue`]).
//! [`FixedMap::get`] returns a shared reference into the element, so callers
//! accumulate into existing entries with atomic read-modify-write after the
//! bucket lock has been released. As with preallocated kernel maps, an element
//! that is removed and reused while a reference is still held can receive a
//! stray update.

use std::cell::UnsafeCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use log::trace;
use spin::{Mutex, MutexGuard};

use crate::error::{ConfigError, MapError};

/// End of a bucket chain or of the free list
const NIL: u32 = u32::MAX;

/// Attempts made on a bucket lock before giving up with `Busy`
pub const LOCK_SPIN_LIMIT: usize = 1 << 14;

/// Elements inspected by the eviction clock before reporting `Full`
const EVICT_SCAN_LIMIT: usize = 64;

/// Largest `max_entries` accepted by [`FixedMap::new`]
pub const MAX_ENTRIES_LIMIT: u32 = 1 << 24;

/// Value stored in a [`FixedMap`]
///
/// Implementors are atomic mirrors of a plain `Copy` record so that a shared
/// reference is enough to update them.
pub trait MapValue: Default + Send + Sync {
    type Plain: Copy;

    /// Read every field
    fn read(&self) -> Self::Plain;

    /// Overwrite every field
    fn write(&self, value: &Self::Plain);
}

impl MapValue for AtomicU8 {
    type Plain = u8;

    fn read(&self) -> u8 {
        self.load(Ordering::Relaxed)
    }

    fn write(&self, value: &u8) {
        self.store(*value, Ordering::Relaxed);
    }
}

/// Update semantics, same as BPF_ANY / BPF_NOEXIST / BPF_EXIST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    /// Create or overwrite
    Any,
    /// Create only
    NoExist,
    /// Overwrite only
    Exist,
}

/// What happens when a new key arrives at a full map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityPolicy {
    /// Refuse the insert with [`MapError::Full`]
    Reject,
    /// Evict an existing entry and reuse its element
    Evict,
}

/// Successful insert outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// New key stored in a free element
    Created,
    /// Existing key overwritten
    Replaced,
    /// Another entry was evicted to make room
    Evicted,
}

struct Elem<K, V> {
    /// Guarded by the lock of the bucket chaining this element
    key: UnsafeCell<Option<K>>,
    /// Guarded by the owning bucket lock, or by the free list lock while free
    next: UnsafeCell<u32>,
    /// Owning bucket, NIL while free or in transit between owners
    bucket: AtomicU32,
    value: V,
}

/// Preallocated hash map with a fixed number of elements
pub struct FixedMap<K, V> {
    name: &'static str,
    policy: CapacityPolicy,
    buckets: Box<[Mutex<u32>]>,
    elems: Box<[Elem<K, V>]>,
    free: Mutex<u32>,
    len: AtomicUsize,
    clock: AtomicUsize,
    hasher: BuildHasherDefault<DefaultHasher>,
}

// SAFETY: `key` and `next` are only accessed while holding the lock that owns
// the element (its bucket lock, or the free list lock while it is free), and
// `value` only exposes `&V` where `V: Sync`.
unsafe impl<K: Send, V: MapValue> Sync for FixedMap<K, V> {}

pub(crate) fn try_lock_bounded<T>(lock: &Mutex<T>) -> Result<MutexGuard<'_, T>, MapError> {
    for _ in 0..LOCK_SPIN_LIMIT {
        if let Some(guard) = lock.try_lock() {
            return Ok(guard);
        }
        core::hint::spin_loop();
    }
    Err(MapError::Busy)
}

impl<K, V> FixedMap<K, V>
where
    K: Copy + Eq + Hash + Send,
    V: MapValue,
{
    /// Allocate a map holding at most `max_entries` keys
    pub fn new(
        name: &'static str,
        max_entries: u32,
        policy: CapacityPolicy,
    ) -> Result<Self, ConfigError> {
        if max_entries == 0 || max_entries > MAX_ENTRIES_LIMIT {
            return Err(ConfigError::InvalidCapacity {
                table: name,
                max: MAX_ENTRIES_LIMIT,
                got: max_entries,
            });
        }

        let n_buckets = (max_entries as usize).next_power_of_two();
        let buckets = (0..n_buckets)
            .map(|_| Mutex::new(NIL))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let elems = (0..max_entries)
            .map(|i| Elem {
                key: UnsafeCell::new(None),
                next: UnsafeCell::new(if i + 1 < max_entries { i + 1 } else { NIL }),
                bucket: AtomicU32::new(NIL),
                value: V::default(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            name,
            policy,
            buckets,
            elems,
            free: Mutex::new(0),
            len: AtomicUsize::new(0),
            clock: AtomicUsize::new(0),
            hasher: BuildHasherDefault::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> CapacityPolicy {
        self.policy
    }

    /// Maximum number of keys
    pub fn capacity(&self) -> usize {
        self.elems.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update `key` according to `flag`
    pub fn insert(
        &self,
        key: &K,
        value: &V::Plain,
        flag: UpdateFlag,
    ) -> Result<Inserted, MapError> {
        let bucket = self.bucket_of(key);
        let mut head = try_lock_bounded(&self.buckets[bucket])?;

        // SAFETY: we hold the bucket lock for this chain.
        if let Some((_, idx)) = unsafe { self.find(*head, key) } {
            if flag == UpdateFlag::NoExist {
                return Err(MapError::Exists);
            }
            self.elems[idx as usize].value.write(value);
            return Ok(Inserted::Replaced);
        }

        if flag == UpdateFlag::Exist {
            return Err(MapError::NotFound);
        }

        if let Some(idx) = self.pop_free()? {
            // SAFETY: `idx` came off the free list and we hold the bucket lock.
            unsafe { self.link(&mut head, bucket, idx, key, value) };
            return Ok(Inserted::Created);
        }

        if self.policy == CapacityPolicy::Reject {
            return Err(MapError::Full);
        }

        // Our bucket stays locked while the victim is chosen, so no one else
        // can insert `key` between the lookup above and the link below.
        let idx = self.evict_one(bucket, &mut head)?;
        // SAFETY: `idx` was unlinked by `evict_one` and is owned by us.
        unsafe { self.link(&mut head, bucket, idx, key, value) };
        Ok(Inserted::Evicted)
    }

    /// Shared reference to the value stored under `key`
    ///
    /// Returns `None` when the key is missing or its bucket stays busy.
    pub fn get(&self, key: &K) -> Option<&V> {
        let head = try_lock_bounded(&self.buckets[self.bucket_of(key)]).ok()?;
        // SAFETY: we hold the bucket lock for this chain.
        let (_, idx) = unsafe { self.find(*head, key) }?;
        Some(&self.elems[idx as usize].value)
    }

    /// Copy of the value stored under `key`
    pub fn lookup(&self, key: &K) -> Option<V::Plain> {
        self.get(key).map(MapValue::read)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Lookup-and-delete
    pub fn take(&self, key: &K) -> Result<V::Plain, MapError> {
        let idx;
        let value;
        {
            let mut head = try_lock_bounded(&self.buckets[self.bucket_of(key)])?;
            // SAFETY: we hold the bucket lock for this chain.
            let (prev, found) = unsafe { self.find(*head, key) }.ok_or(MapError::NotFound)?;
            idx = found;
            value = self.elems[idx as usize].value.read();
            // SAFETY: `prev`/`idx` were found under the same lock.
            unsafe { self.unlink(&mut head, prev, idx) };
        }
        self.push_free(idx);
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Result<(), MapError> {
        self.take(key).map(|_| ())
    }

    /// Copy of every entry
    ///
    /// Consumer side only: allocates and may wait on bucket locks.
    pub fn entries(&self) -> Vec<(K, V::Plain)> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in self.buckets.iter() {
            let head = bucket.lock();
            let mut cur = *head;
            while cur != NIL {
                let elem = &self.elems[cur as usize];
                // SAFETY: we hold the lock of the bucket chaining `elem`.
                unsafe {
                    if let Some(key) = *elem.key.get() {
                        out.push((key, elem.value.read()));
                    }
                    cur = *elem.next.get();
                }
            }
        }
        out
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    /// Remove and return every entry
    ///
    /// Consumer side only. Entries inserted concurrently into buckets that
    /// were already visited stay in the map.
    pub fn drain(&self) -> Vec<(K, V::Plain)> {
        let mut out = Vec::with_capacity(self.len());
        let mut freed = Vec::new();
        for bucket in self.buckets.iter() {
            let mut head = bucket.lock();
            while *head != NIL {
                let idx = *head;
                let elem = &self.elems[idx as usize];
                // SAFETY: we hold the lock of the bucket chaining `elem`.
                unsafe {
                    if let Some(key) = *elem.key.get() {
                        out.push((key, elem.value.read()));
                    }
                    self.unlink(&mut head, NIL, idx);
                }
                freed.push(idx);
            }
        }
        for idx in freed {
            self.push_free(idx);
        }
        out
    }

    fn bucket_of(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) as usize) & (self.buckets.len() - 1)
    }

    /// Position of `key` in the chain starting at `head` as (previous, index)
    ///
    /// # Safety
    ///
    /// The caller holds the lock of the bucket whose head is `head`.
    unsafe fn find(&self, head: u32, key: &K) -> Option<(u32, u32)> {
        let mut prev = NIL;
        let mut cur = head;
        while cur != NIL {
            let elem = &self.elems[cur as usize];
            if (*elem.key.get()).as_ref() == Some(key) {
                return Some((prev, cur));
            }
            prev = cur;
            cur = *elem.next.get();
        }
        None
    }

    /// Predecessor of element `idx` in the chain starting at `head`
    ///
    /// # Safety
    ///
    /// Same as [`Self::find`].
    unsafe fn predecessor(&self, head: u32, idx: u32) -> Option<u32> {
        let mut prev = NIL;
        let mut cur = head;
        while cur != NIL {
            if cur == idx {
                return Some(prev);
            }
            prev = cur;
            cur = *self.elems[cur as usize].next.get();
        }
        None
    }

    /// # Safety
    ///
    /// The caller holds the bucket lock guarding `head` and owns `idx`
    /// exclusively (fresh off the free list or unlinked by eviction).
    unsafe fn link(&self, head: &mut u32, bucket: usize, idx: u32, key: &K, value: &V::Plain) {
        let elem = &self.elems[idx as usize];
        elem.value.write(value);
        *elem.key.get() = Some(*key);
        *elem.next.get() = *head;
        elem.bucket.store(bucket as u32, Ordering::Release);
        *head = idx;
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// The caller holds the bucket lock guarding `head`, and `prev` is the
    /// predecessor of `idx` in that chain (NIL when `idx` is the head).
    unsafe fn unlink(&self, head: &mut u32, prev: u32, idx: u32) {
        let elem = &self.elems[idx as usize];
        let next = *elem.next.get();
        if prev == NIL {
            *head = next;
        } else {
            *self.elems[prev as usize].next.get() = next;
        }
        *elem.key.get() = None;
        elem.bucket.store(NIL, Ordering::Release);
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    fn pop_free(&self) -> Result<Option<u32>, MapError> {
        let mut head = try_lock_bounded(&self.free)?;
        let idx = *head;
        if idx == NIL {
            return Ok(None);
        }
        // SAFETY: free elements are only touched under the free list lock.
        *head = unsafe { *self.elems[idx as usize].next.get() };
        Ok(Some(idx))
    }

    // Pushing an element back cannot be dropped without shrinking the map for
    // good, so this waits for the lock. It only nests inside bucket locks and
    // holds it for two stores.
    fn push_free(&self, idx: u32) {
        let mut head = self.free.lock();
        // SAFETY: `idx` is unlinked and owned by the caller.
        unsafe { *self.elems[idx as usize].next.get() = *head };
        *head = idx;
    }

    /// Unlink an entry chosen by the clock hand and hand its element over
    ///
    /// The caller holds the lock of `own_bucket`, whose head is `own_head`.
    /// Victims in other buckets are only tried, so two evicting inserts can
    /// never wait on each other.
    fn evict_one(&self, own_bucket: usize, own_head: &mut u32) -> Result<u32, MapError> {
        let n = self.elems.len();
        for _ in 0..n.min(EVICT_SCAN_LIMIT) {
            let idx = (self.clock.fetch_add(1, Ordering::Relaxed) % n) as u32;
            let bucket = self.elems[idx as usize].bucket.load(Ordering::Acquire);
            if bucket == NIL {
                continue;
            }

            if bucket as usize == own_bucket {
                // SAFETY: the caller holds this bucket's lock.
                if let Some(prev) = unsafe { self.predecessor(*own_head, idx) } {
                    unsafe { self.unlink(own_head, prev, idx) };
                    trace!("{}: evicted element {}", self.name, idx);
                    return Ok(idx);
                }
                continue;
            }

            let Some(mut head) = self.buckets[bucket as usize].try_lock() else {
                continue;
            };
            // The element may have moved since `bucket` was read, only take
            // it if it is still chained here.
            // SAFETY: we hold this bucket's lock.
            if let Some(prev) = unsafe { self.predecessor(*head, idx) } {
                unsafe { self.unlink(&mut head, prev, idx) };
                trace!("{}: evicted element {}", self.name, idx);
                return Ok(idx);
            }
        }

        // Something may have been freed while we were scanning.
        self.pop_free()?.ok_or(MapError::Full)
    }

    /// Hold the lock of the bucket `key` hashes to
    #[cfg(test)]
    pub(crate) fn hold_bucket(&self, key: &K) -> MutexGuard<'_, u32> {
        self.buckets[self.bucket_of(key)].lock()
    }
}
