//! A deterministic priority queue that ensures any item is only included at most once.

use std::collections::{BTreeMap, BTreeSet};

/// A deterministic priority queue that ensures any item is only included at most once.
///
/// Items sharing a priority are ordered by the item itself, so iteration order never depends
/// on insertion history or hashing.
pub struct PriorityQueue<I: Ord + Clone, V: Ord + Clone> {
    entries: BTreeSet<(V, I)>,
    keys: BTreeMap<I, V>,
}

impl<I: Ord + Clone, V: Ord + Clone> Default for PriorityQueue<I, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Ord + Clone, V: Ord + Clone> PriorityQueue<I, V> {
    /// Create a new priority queue.
    pub const fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
            keys: BTreeMap::new(),
        }
    }

    /// Insert an item with a value, overwriting the previous value if it exists.
    pub fn put(&mut self, item: I, value: V) {
        if let Some(old_value) = self.keys.insert(item.clone(), value.clone()) {
            self.entries.remove(&(old_value, item.clone()));
        }
        self.entries.insert((value, item));
    }

    /// Remove an item, returning its value if it was present.
    pub fn remove(&mut self, item: &I) -> Option<V> {
        let value = self.keys.remove(item)?;
        self.entries.remove(&(value.clone(), item.clone()));
        Some(value)
    }

    /// Returns the value associated with `item`.
    pub fn get(&self, item: &I) -> Option<&V> {
        self.keys.get(item)
    }

    /// Returns the item with the smallest value.
    pub fn peek(&self) -> Option<(&I, &V)> {
        self.entries.first().map(|(value, item)| (item, value))
    }

    /// Removes and returns the item with the smallest value.
    pub fn pop(&mut self) -> Option<(I, V)> {
        let (value, item) = self.entries.pop_first()?;
        self.keys.remove(&item);
        Some((item, value))
    }

    /// Iterate over all items in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (&I, &V)> {
        self.entries.iter().map(|(value, item)| (item, value))
    }

    /// Returns the number of items in the queue.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
