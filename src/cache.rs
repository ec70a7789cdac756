//! Bounded S3-FIFO cache.
//!
//! New entries land in a small FIFO queue. Entries read at least twice while
//! there are promoted to the main queue, the rest are evicted and remembered
//! in a ghost queue so that a quick re-insert goes straight to main.
//!
//! ```text
//!   insert ──► [ small ] ──freq > 1──► [ main ] ──freq == 0──► evicted
//!                  │                      ▲
//!                  └──► [ ghost keys ] ───┘ (re-insert)
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
};

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Slot<V> {
    value: V,
    freq: u8,
}

pub struct Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    capacity: usize,
    max_small_size: usize,
    /// new entries are added to this queue
    small: VecDeque<K>,
    /// entries accessed more than once while in small
    main: VecDeque<K>,
    /// keys recently evicted from small
    ghost: VecDeque<K>,
    ghost_keys: HashSet<K>,
    entries: HashMap<K, Slot<V>>,
    hits: usize,
    misses: usize,
}

impl<K, V> std::fmt::Debug for Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Cache {
            capacity,
            max_small_size: (capacity / 10).max(1),
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Returns a copy of the cached value and bumps its frequency.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.freq = (slot.freq + 1).min(MAX_FREQUENCY_LIMIT);
                self.hits += 1;
                Some(slot.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            return;
        }

        while self.entries.len() >= self.capacity {
            self.evict();
        }

        if self.ghost_keys.remove(&key) {
            self.ghost.retain(|k| k != &key);
            self.main.push_back(key.clone());
        } else {
            self.small.push_back(key.clone());
        }
        self.entries.insert(key, Slot { value, freq: 0 });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    fn evict(&mut self) {
        if self.small.len() >= self.max_small_size || self.main.is_empty() {
            self.evict_small();
        } else {
            self.evict_main();
        }
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let freq = self.entries.get(&key).map_or(0, |slot| slot.freq);
            if freq > 1 {
                if let Some(slot) = self.entries.get_mut(&key) {
                    slot.freq = 0;
                }
                self.main.push_back(key);
                continue;
            }

            self.entries.remove(&key);
            self.remember(key);
            return;
        }

        self.evict_main();
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            match self.entries.get_mut(&key) {
                Some(slot) if slot.freq > 0 => {
                    slot.freq -= 1;
                    self.main.push_back(key);
                }
                _ => {
                    self.entries.remove(&key);
                    return;
                }
            }
        }
    }

    fn remember(&mut self, key: K) {
        if self.ghost.len() >= self.capacity {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_keys.remove(&old);
            }
        }
        self.ghost_keys.insert(key.clone());
        self.ghost.push_back(key);
    }
}
