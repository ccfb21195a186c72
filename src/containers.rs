//! Small bounded collections used by the delivery pipeline.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Recently seen keys, most recent first. Pushing past capacity evicts the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct DedupRing<K> {
    entries: VecDeque<K>,
    capacity: usize,
}

impl<K: PartialEq> DedupRing<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn push(&mut self, key: K) {
        self.entries.push_front(key);
        self.entries.truncate(self.capacity);
    }

    /// Pushes `key` unless it is already present. Returns whether it was new.
    pub fn check_and_push(&mut self, key: K) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.push(key);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Map with a size cap; inserting past it evicts the least recently inserted
/// key.
#[derive(Debug, Clone)]
pub struct SizedMap<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> SizedMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.map.insert(key.clone(), value);
        if previous.is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
