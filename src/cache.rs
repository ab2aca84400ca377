//! Block cache with namespaced keys and ref-counted handles.
//!
//! The cache maps a 64-bit file-scoped key (the block's file offset, scoped
//! by a per-file namespace) to an opaque decoded value. Lookups either probe
//! (`fill` absent) or get-or-fill (`fill` present); the fill runs under the
//! cache lock, so a concurrent miss can never decode the same block twice
//! and store both.
//!
//! Admission and eviction follow a three-queue design: new entries enter a
//! small probationary queue, entries accessed more than once graduate to the
//! main queue, and entries evicted from the small queue before proving
//! themselves leave a ghost (key-only) trace so their next admission goes
//! straight to main. Eviction policy is opaque to callers; the only contract
//! is that capacity pressure evicts and outstanding handles keep their value
//! alive.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum access frequency tracked per entry.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Opaque cached value. Consumers downcast on retrieval and treat a type
/// mismatch as corruption.
pub type Value = Arc<dyn Any + Send + Sync>;

/// A ref-counted reference to a cached value. The value stays alive while
/// any handle exists, even if the cache evicts the entry underneath it.
pub struct Handle {
    value: Value,
}

impl Handle {
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Drops this reference. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        Handle {
            value: self.value.clone(),
        }
    }
}

type CacheKey = (u64, u64);

struct Entry {
    /// `None` marks a ghost: the key was seen and evicted from the small
    /// queue, so readmission goes straight to main.
    value: Option<Value>,
    charge: usize,
    freq: u8,
}

struct Inner {
    entries: HashMap<CacheKey, Entry>,
    small: VecDeque<CacheKey>,
    main: VecDeque<CacheKey>,
    ghost: VecDeque<CacheKey>,
    used: usize,
}

/// Capacity-bounded cache shared by every table reader of a database.
pub struct Cache {
    inner: Mutex<Inner>,
    capacity: usize,
    max_main: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Cache {
    /// `capacity` is the total charge (decoded bytes) the cache may hold.
    pub fn new(capacity: usize) -> Self {
        let max_small = capacity / 10;
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                small: VecDeque::new(),
                main: VecDeque::new(),
                ghost: VecDeque::new(),
                used: 0,
            }),
            capacity,
            max_main: capacity - max_small,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// A view of this cache scoped to one file.
    pub fn namespace(self: &Arc<Self>, ns: u64) -> Namespace {
        Namespace {
            cache: self.clone(),
            ns,
        }
    }

    /// Looks up `(ns, key)`. On a miss with `fill` present, runs the
    /// producer and stores its `(charge, value)` result; a producer
    /// returning `None` stores nothing (its error travels out of band).
    pub fn get(
        &self,
        ns: u64,
        key: u64,
        fill: Option<&mut dyn FnMut() -> Option<(usize, Value)>>,
    ) -> Option<Handle> {
        let ck = (ns, key);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = inner.entries.get_mut(&ck) {
            if let Some(value) = &entry.value {
                entry.freq = (entry.freq + 1).min(MAX_FREQUENCY_LIMIT);
                let handle = Handle {
                    value: value.clone(),
                };
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(handle);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fill = fill?;
        let (charge, value) = fill()?;
        self.insert(&mut inner, ck, charge, value.clone());
        Some(Handle { value })
    }

    /// `(hits, misses)` counters since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn insert(&self, inner: &mut Inner, ck: CacheKey, charge: usize, value: Value) {
        self.evict_for(inner, charge);

        let was_ghost = matches!(
            inner.entries.get(&ck),
            Some(Entry { value: None, .. })
        );
        inner.entries.insert(
            ck,
            Entry {
                value: Some(value),
                charge,
                freq: 0,
            },
        );
        inner.used += charge;
        if was_ghost {
            remove_key(&mut inner.ghost, ck);
            inner.main.push_back(ck);
        } else {
            inner.small.push_back(ck);
        }
    }

    fn evict_for(&self, inner: &mut Inner, incoming: usize) {
        while inner.used + incoming > self.capacity
            && (!inner.small.is_empty() || !inner.main.is_empty())
        {
            let main_charge: usize = inner
                .main
                .iter()
                .filter_map(|k| inner.entries.get(k))
                .map(|e| e.charge)
                .sum();
            if main_charge >= self.max_main || inner.small.is_empty() {
                self.evict_main(inner);
            } else {
                self.evict_small(inner);
            }
        }
    }

    fn evict_main(&self, inner: &mut Inner) {
        while let Some(ck) = inner.main.pop_front() {
            let Some(entry) = inner.entries.get_mut(&ck) else {
                continue;
            };
            if entry.freq > 0 {
                entry.freq -= 1;
                inner.main.push_back(ck);
            } else {
                inner.used -= entry.charge;
                inner.entries.remove(&ck);
                return;
            }
        }
    }

    fn evict_small(&self, inner: &mut Inner) {
        while let Some(ck) = inner.small.pop_front() {
            let Some(entry) = inner.entries.get_mut(&ck) else {
                continue;
            };
            if entry.freq > 1 {
                inner.main.push_back(ck);
            } else {
                // Demote to ghost: value dropped, key remembered.
                entry.value = None;
                inner.used -= entry.charge;
                entry.charge = 0;
                inner.ghost.push_back(ck);
                if inner.ghost.len() > inner.small.len() + inner.main.len() + 16 {
                    if let Some(old) = inner.ghost.pop_front() {
                        inner.entries.remove(&old);
                    }
                }
                return;
            }
        }
    }
}

fn remove_key(queue: &mut VecDeque<CacheKey>, ck: CacheKey) {
    if let Some(pos) = queue.iter().position(|&k| k == ck) {
        queue.remove(pos);
    }
}

/// A cache scoped to one file's blocks. Keys are block file offsets.
pub struct Namespace {
    cache: Arc<Cache>,
    ns: u64,
}

impl Namespace {
    pub fn get(
        &self,
        key: u64,
        fill: Option<&mut dyn FnMut() -> Option<(usize, Value)>>,
    ) -> Option<Handle> {
        self.cache.get(self.ns, key, fill)
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }
}

impl Clone for Namespace {
    fn clone(&self) -> Self {
        Namespace {
            cache: self.cache.clone(),
            ns: self.ns,
        }
    }
}
