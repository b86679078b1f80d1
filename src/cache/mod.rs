//! Fixed-capacity LRU cache for read-only query results.
//!
//! Entries live in a slab of nodes linked into a recency list (head is the
//! most recently used, tail the least) with a hash index from key to slot.
//! `get`, `put` and eviction are all O(1). There is no TTL and no size-based
//! eviction: only the entry count is bounded.
//!
//! The cache is not synchronised. The owner serialises access, e.g. by
//! holding it behind a `Mutex` as the query layer does.

use std::collections::HashMap;
use std::hash::Hash;

use sha2::{Digest, Sha256};

/// Normalised hash identifying a cacheable request.
///
/// Requests are case-folded and trimmed before hashing, so `"Top Repos "`
/// and `"top repos"` share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_request(request: &str) -> Self {
        let normalized = request.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Hit/miss counters for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries. A capacity of zero
    /// is bumped to one so `put` followed by `get` always round-trips.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let Some(&slot) = self.index.get(key) else {
            self.stats.misses += 1;
            return None;
        };
        self.stats.hits += 1;
        self.move_to_front(slot);
        self.nodes[slot].as_ref().map(|node| &node.value)
    }

    /// Insert or replace `key`. Returns the evicted entry, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.nodes[slot].as_mut() {
                node.value = value;
            }
            self.move_to_front(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.evict_tail()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
        evicted
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        self.free.push(slot);
        self.nodes[slot].take().map(|node| node.value)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.nodes[slot].as_ref() else {
                break;
            };
            keys.push(&node.key);
            cursor = node.next;
        }
        keys
    }

    fn evict_tail(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        self.unlink(slot);
        let node = self.nodes[slot].take()?;
        self.index.remove(&node.key);
        self.free.push(slot);
        self.stats.evictions += 1;
        Some((node.key, node.value))
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[slot].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(head) = old_head {
            if let Some(node) = self.nodes[head].as_mut() {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.nodes[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.nodes[slot].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get_returns_value() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"missing"), None);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let mut cache = LruCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        // Touch "a" so "b" becomes the least recently used.
        assert_eq!(cache.get(&"a"), Some(&1));

        let evicted = cache.put("d", 4);
        assert_eq!(evicted, Some(("b", 2)));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
        assert!(cache.contains(&"d"));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_update_existing_refreshes_recency_without_eviction() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert!(cache.put("a", 10).is_none());
        assert_eq!(cache.keys_by_recency(), vec![&"a", &"b"]);

        let evicted = cache.put("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn test_slots_are_reused_after_eviction() {
        let mut cache = LruCache::new(2);
        for i in 0..100 {
            cache.put(i, i * 2);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.nodes.len() <= 3);
        assert_eq!(cache.keys_by_recency(), vec![&99, &98]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = LruCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);
        assert_eq!(cache.keys_by_recency(), vec![&"b"]);

        cache.clear();
        assert!(cache.is_empty());
        cache.put("c", 3);
        assert_eq!(cache.get(&"c"), Some(&3));
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let mut cache = LruCache::new(0);
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(&1));
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_fingerprint_normalizes_case_and_whitespace() {
        let a = Fingerprint::from_request("  Top Python Repos ");
        let b = Fingerprint::from_request("top python repos");
        let c = Fingerprint::from_request("top rust repos");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }
}
