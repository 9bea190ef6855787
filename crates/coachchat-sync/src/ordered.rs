//! Id-indexed ordered map with O(1) move-to-front.
//!
//! Entries form a doubly linked list threaded through a `HashMap` by key, so
//! lookups, front insertion and move-to-front never shift other entries.

use std::{collections::HashMap, hash::Hash};

struct Node<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

/// Insertion-ordered map whose entries can be moved to the head.
pub struct OrderedMap<K, V> {
    nodes: HashMap<K, Node<K, V>>,
    head: Option<K>,
    tail: Option<K>,
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K: Hash + Eq + Clone, V> OrderedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.nodes.get(key).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.nodes.get_mut(key).map(|node| &mut node.value)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Append at the tail. An existing entry keeps its position and gets the
    /// new value.
    pub fn push_back(&mut self, key: K, value: V) {
        if let Some(node) = self.nodes.get_mut(&key) {
            node.value = value;
            return;
        }
        let prev = self.tail.replace(key.clone());
        match &prev {
            Some(prev_key) => self.link_next(prev_key, Some(key.clone())),
            None => self.head = Some(key.clone()),
        }
        self.nodes.insert(key, Node { value, prev, next: None });
    }

    /// Insert or replace at the head.
    pub fn push_front(&mut self, key: K, value: V) {
        if let Some(node) = self.nodes.get_mut(&key) {
            node.value = value;
            self.move_to_front(&key);
            return;
        }
        let next = self.head.replace(key.clone());
        match &next {
            Some(next_key) => self.link_prev(next_key, Some(key.clone())),
            None => self.tail = Some(key.clone()),
        }
        self.nodes.insert(key, Node { value, prev: None, next });
    }

    /// Move an entry to the head, keeping the relative order of the rest.
    ///
    /// Returns `false` if the key is absent.
    pub fn move_to_front(&mut self, key: &K) -> bool {
        let Some(node) = self.nodes.get(key) else {
            return false;
        };
        let Some(prev) = node.prev.clone() else {
            // Already at the head.
            return true;
        };
        let next = node.next.clone();

        self.link_next(&prev, next.clone());
        match &next {
            Some(next_key) => self.link_prev(next_key, Some(prev)),
            None => self.tail = Some(prev),
        }

        let old_head = self.head.replace(key.clone());
        if let Some(old_head) = &old_head {
            self.link_prev(old_head, Some(key.clone()));
        }
        if let Some(node) = self.nodes.get_mut(key) {
            node.prev = None;
            node.next = old_head;
        }
        true
    }

    /// Values from head to tail.
    pub fn values(&self) -> Values<'_, K, V> {
        Values {
            map: self,
            cursor: self.head.as_ref(),
        }
    }

    fn link_next(&mut self, key: &K, next: Option<K>) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.next = next;
        }
    }

    fn link_prev(&mut self, key: &K, prev: Option<K>) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.prev = prev;
        }
    }
}

/// Head-to-tail iterator over the values of an [`OrderedMap`].
pub struct Values<'a, K, V> {
    map: &'a OrderedMap<K, V>,
    cursor: Option<&'a K>,
}

impl<'a, K: Hash + Eq, V> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.map.nodes.get(self.cursor?)?;
        self.cursor = node.next.as_ref();
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(map: &OrderedMap<&'static str, u32>) -> Vec<u32> {
        map.values().copied().collect()
    }

    fn filled() -> OrderedMap<&'static str, u32> {
        let mut map = OrderedMap::new();
        for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            map.push_back(key, value);
        }
        map
    }

    #[test]
    fn test_move_to_front_preserves_rest() {
        let mut map = filled();
        assert!(map.move_to_front(&"c"));
        assert_eq!(order(&map), [3, 1, 2, 4]);

        assert!(map.move_to_front(&"d"));
        assert_eq!(order(&map), [4, 3, 1, 2]);

        assert!(map.move_to_front(&"d"));
        assert_eq!(order(&map), [4, 3, 1, 2]);

        assert!(!map.move_to_front(&"zz"));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_tail_tracks_moves() {
        let mut map = filled();
        map.move_to_front(&"d");
        map.push_back("e", 5);
        assert_eq!(order(&map), [4, 1, 2, 3, 5]);
    }

    #[test]
    fn test_push_front_is_idempotent() {
        let mut map = filled();
        map.push_front("b", 20);
        map.push_front("b", 21);
        assert_eq!(order(&map), [21, 1, 3, 4]);

        map.push_front("new", 9);
        assert_eq!(order(&map), [9, 21, 1, 3, 4]);
    }

    #[test]
    fn test_single_entry_and_clear() {
        let mut map = OrderedMap::new();
        map.push_front("only", 1);
        assert!(map.move_to_front(&"only"));
        assert_eq!(order(&map), [1]);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(order(&map), Vec::<u32>::new());
    }
}
