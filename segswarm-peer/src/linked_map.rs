//! Insertion-ordered map with O(1) append at either end, O(1) removal and
//! traversal in both directions starting from any key.
//!
//! Links are stored as neighbouring keys rather than pointers, so the whole
//! structure is a single `HashMap` and needs no unsafe code.

use std::{borrow::Borrow, collections::HashMap, hash::Hash};

#[derive(Debug, Clone)]
struct Node<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

#[derive(Debug, Clone)]
pub struct LinkedMap<K, V> {
    nodes: HashMap<K, Node<K, V>>,
    first: Option<K>,
    last: Option<K>,
}

impl<K, V> Default for LinkedMap<K, V> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            first: None,
            last: None,
        }
    }
}

impl<K: Clone + Eq + Hash, V> LinkedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.nodes.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.nodes.get(key).map(|node| &node.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.nodes.get_mut(key).map(|node| &mut node.value)
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        self.first.as_ref().and_then(|k| self.entry(k))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        self.last.as_ref().and_then(|k| self.entry(k))
    }

    /// Append at the end. An existing entry for `key` is unlinked first, so
    /// the key always ends up last. Returns the replaced value.
    pub fn push_back(&mut self, key: K, value: V) -> Option<V> {
        let prior = self.remove(&key);
        let node = Node {
            value,
            prev: self.last.clone(),
            next: None,
        };
        match self.last.as_ref().and_then(|k| self.nodes.get_mut(k)) {
            Some(tail) => tail.next = Some(key.clone()),
            None => self.first = Some(key.clone()),
        }
        self.last = Some(key.clone());
        self.nodes.insert(key, node);
        prior
    }

    /// Prepend at the start. An existing entry for `key` is unlinked first.
    pub fn push_front(&mut self, key: K, value: V) -> Option<V> {
        let prior = self.remove(&key);
        let node = Node {
            value,
            prev: None,
            next: self.first.clone(),
        };
        match self.first.as_ref().and_then(|k| self.nodes.get_mut(k)) {
            Some(head) => head.prev = Some(key.clone()),
            None => self.last = Some(key.clone()),
        }
        self.first = Some(key.clone());
        self.nodes.insert(key, node);
        prior
    }

    /// Move an existing entry to the end. Returns false if `key` is absent.
    pub fn move_to_back<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some((key, _)) = self.nodes.get_key_value(key) else {
            return false;
        };
        if self.last.as_ref() == Some(key) {
            return true;
        }
        let key = key.clone();
        if let Some(value) = self.remove::<K>(&key) {
            self.push_back(key, value);
        }
        true
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let node = self.nodes.remove(key)?;
        match node.prev.as_ref().and_then(|k| self.nodes.get_mut::<K>(k)) {
            Some(prev) => prev.next = node.next.clone(),
            None => self.first = node.next.clone(),
        }
        match node.next.as_ref().and_then(|k| self.nodes.get_mut::<K>(k)) {
            Some(next) => next.prev = node.prev.clone(),
            None => self.last = node.prev.clone(),
        }
        Some(node.value)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.first = None;
        self.last = None;
    }

    /// Value following `key`, if any.
    pub fn next_to<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.nodes
            .get(key)
            .and_then(|node| node.next.as_ref())
            .and_then(|k| self.entry(k))
    }

    /// Value preceding `key`, if any.
    pub fn prev_to<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.nodes
            .get(key)
            .and_then(|node| node.prev.as_ref())
            .and_then(|k| self.entry(k))
    }

    /// Entries from first to last.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            cursor: self.first.as_ref(),
            forward: true,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    /// Entries from `key` (inclusive) to the end. Empty if `key` is absent.
    pub fn iter_from<Q>(&self, key: &Q) -> Iter<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Iter {
            map: self,
            cursor: self.nodes.get_key_value(key).map(|(k, _)| k),
            forward: true,
        }
    }

    /// Entries from `key` (inclusive) back to the start. Empty if `key` is
    /// absent.
    pub fn iter_backward_from<Q>(&self, key: &Q) -> Iter<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Iter {
            map: self,
            cursor: self.nodes.get_key_value(key).map(|(k, _)| k),
            forward: false,
        }
    }

    fn entry(&self, key: &K) -> Option<(&K, &V)> {
        self.nodes
            .get_key_value(key)
            .map(|(k, node)| (k, &node.value))
    }
}

pub struct Iter<'a, K, V> {
    map: &'a LinkedMap<K, V>,
    cursor: Option<&'a K>,
    forward: bool,
}

impl<'a, K: Clone + Eq + Hash, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let (key, node) = self.map.nodes.get_key_value(key)?;
        self.cursor = if self.forward {
            node.next.as_ref()
        } else {
            node.prev.as_ref()
        };
        Some((key, &node.value))
    }
}

impl<K: Clone + Eq + Hash, V> FromIterator<(K, V)> for LinkedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = LinkedMap::new();
        for (k, v) in iter {
            map.push_back(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::LinkedMap;

    fn keys(map: &LinkedMap<&'static str, u32>) -> Vec<&'static str> {
        map.keys().copied().collect()
    }

    #[test]
    fn push_back_and_front_order() {
        let mut map = LinkedMap::new();
        map.push_back("b", 2);
        map.push_back("c", 3);
        map.push_front("a", 1);
        assert_eq!(keys(&map), vec!["a", "b", "c"]);
        assert_eq!(map.first(), Some((&"a", &1)));
        assert_eq!(map.last(), Some((&"c", &3)));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn remove_relinks_neighbours() {
        let mut map: LinkedMap<_, _> = [("a", 1), ("b", 2), ("c", 3), ("d", 4)]
            .into_iter()
            .collect();
        assert_eq!(map.remove("b"), Some(2));
        assert_eq!(keys(&map), vec!["a", "c", "d"]);
        assert_eq!(map.remove("a"), Some(1));
        assert_eq!(map.first(), Some((&"c", &3)));
        assert_eq!(map.remove("d"), Some(4));
        assert_eq!(map.last(), Some((&"c", &3)));
        assert_eq!(map.remove("d"), None);
        assert_eq!(map.remove("c"), Some(3));
        assert!(map.is_empty());
        assert!(map.first().is_none());
        assert!(map.last().is_none());
    }

    #[test]
    fn reinsert_moves_key() {
        let mut map: LinkedMap<_, _> = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        assert_eq!(map.push_back("a", 10), Some(1));
        assert_eq!(keys(&map), vec!["b", "c", "a"]);
        assert!(map.move_to_back("b"));
        assert_eq!(keys(&map), vec!["c", "a", "b"]);
        assert!(!map.move_to_back("zz"));
        assert_eq!(map.get("a"), Some(&10));
    }

    #[test]
    fn traversal_from_key() {
        let map: LinkedMap<_, _> = [("a", 1), ("b", 2), ("c", 3), ("d", 4)]
            .into_iter()
            .collect();
        let forward: Vec<_> = map.iter_from("b").map(|(_, v)| *v).collect();
        assert_eq!(forward, vec![2, 3, 4]);
        let backward: Vec<_> = map.iter_backward_from("c").map(|(_, v)| *v).collect();
        assert_eq!(backward, vec![3, 2, 1]);
        assert_eq!(map.iter_from("missing").count(), 0);
        assert_eq!(map.next_to("b"), Some((&"c", &3)));
        assert_eq!(map.prev_to("b"), Some((&"a", &1)));
        assert_eq!(map.next_to("d"), None);
    }

    #[test]
    fn clear_resets_ends() {
        let mut map: LinkedMap<_, _> = [("a", 1)].into_iter().collect();
        map.clear();
        assert!(map.is_empty());
        map.push_front("z", 26);
        assert_eq!(keys(&map), vec!["z"]);
    }
}
