//! Capacity-limited string-keyed map.

use std::collections::HashMap;

/// A plain key → value map with a fixed entry cap.
///
/// The store has no policy of its own: it reports when it is full and the
/// owner decides what to remove. Synchronization is the owner's job.
#[derive(Debug)]
pub struct BoundedStore<T> {
    entries: HashMap<String, T>,
    capacity: usize,
}

impl<T> BoundedStore<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether inserting a new key would exceed capacity.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&mut self, key: String, value: T) -> Option<T> {
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Remove every entry, returning them.
    pub fn drain(&mut self) -> Vec<(String, T)> {
        self.entries.drain().collect()
    }
}
