//! Time- and size-bounded cache with an eviction hook.
//!
//! Keeps recently released values warm for reuse: a fetch pins the entry,
//! releases unpin it, and only unpinned entries can be dropped, either by
//! the periodic TTL sweep or by capacity pressure on insert. The eviction
//! hook is the last-resort cleanup for the cached value; it runs after the
//! cache lock is released.
//!
//! An expired entry that is fetched before the sweep reaches it is served
//! anyway and gets a fresh deadline; staleness here only bounds memory, it
//! is not a correctness property.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

type EvictHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

struct Entry<V> {
    value: V,
    deadline: Instant,
    pins: u32,
}

pub struct ReuseCache<K: Hash + Eq + Clone, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    capacity: usize,
    ttl: Duration,
    on_evict: EvictHook<K, V>,
}

impl<K: Hash + Eq + Clone, V: Clone> ReuseCache<K, V> {
    pub fn new(
        capacity: usize,
        ttl: Duration,
        on_evict: impl Fn(&K, &V) + Send + Sync + 'static,
    ) -> Self {
        ReuseCache {
            inner: Mutex::new(LruCache::unbounded()),
            capacity,
            ttl,
            on_evict: Box::new(on_evict),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().expect("lock").contains(key)
    }

    /// Return the cached value for `key`, or insert the one `make`
    /// produces. Either way the entry ends up pinned and most recent, with
    /// a fresh deadline. The boolean reports whether it was a hit.
    pub fn fetch_or_insert_pinned(&self, key: K, make: impl FnOnce() -> V) -> (V, bool) {
        let mut evicted: Option<(K, V)> = None;

        let result = {
            let mut inner = self.inner.lock().expect("lock");
            if let Some(entry) = inner.get_mut(&key) {
                entry.deadline = Instant::now() + self.ttl;
                entry.pins += 1;
                (entry.value.clone(), true)
            } else {
                let value = make();
                inner.put(
                    key,
                    Entry {
                        value: value.clone(),
                        deadline: Instant::now() + self.ttl,
                        pins: 1,
                    },
                );
                if inner.len() > self.capacity {
                    evicted = evict_one_unpinned(&mut inner);
                }
                (value, false)
            }
        };

        if let Some((key, value)) = &evicted {
            (self.on_evict)(key, value);
        }
        result
    }

    /// Refresh the recency of `key` without touching pins or deadline.
    pub fn touch(&self, key: &K) {
        let _ = self.inner.lock().expect("lock").get(key);
    }

    /// Drop one pin. The entry stays cached until sweep or capacity
    /// pressure takes it.
    pub fn unpin(&self, key: &K) {
        let mut inner = self.inner.lock().expect("lock");
        if let Some(entry) = inner.peek_mut(key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Drop every expired unpinned entry, running the eviction hook for
    /// each. Returns how many entries were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().expect("lock");
            let expired: Vec<K> = inner
                .iter()
                .filter(|(_, entry)| entry.pins == 0 && entry.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(entry) = inner.pop(&key) {
                    evicted.push((key, entry.value));
                }
            }
        }
        for (key, value) in &evicted {
            (self.on_evict)(key, value);
        }
        evicted.len()
    }
}

/// Pop entries from the cold end until an unpinned one shows up. Pinned
/// entries popped on the way are re-inserted, which refreshes their
/// recency.
fn evict_one_unpinned<K: Hash + Eq + Clone, V>(
    inner: &mut LruCache<K, Entry<V>>,
) -> Option<(K, V)> {
    let mut pinned = Vec::new();
    let mut victim = None;
    while let Some((key, entry)) = inner.pop_lru() {
        if entry.pins == 0 {
            victim = Some((key, entry.value));
            break;
        }
        pinned.push((key, entry));
    }
    for (key, entry) in pinned {
        inner.put(key, entry);
    }
    victim
}
