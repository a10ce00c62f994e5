//! In-memory LRU tier.
//!
//! Entries live in an arena of slots addressed by index. The recency list
//! threads through the slots via `prev`/`next` indices (head is most recently
//! used, tail is least), and a key index maps each key to its slot. Freed
//! slots go on a free list and are reused before the arena grows.
//!
//! # Invariants
//!
//! - A key is in `index` iff its slot is reachable from `head` exactly once.
//! - `current_size` equals the summed `size_bytes` of live entries and never
//!   exceeds `max_size`.
//!
//! The structure is not thread-safe; the coordinator wraps it in a mutex and
//! never holds that mutex across an await point.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use wecache_core::{
    encode_value, CacheEntry, CacheValue, Clock, EntryMetadata, MemoryStats,
    MemoryTierConfig,
};

/// Callback invoked with every entry evicted to stay under the byte budget.
pub type EvictionListener<V> = Box<dyn FnMut(&CacheEntry<V>) + Send>;

/// Outcome of a `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Stored at the head; `evicted` entries were pushed out to make room.
    Stored { evicted: usize },
    /// Larger than the whole budget. Nothing changed.
    Oversized { size_bytes: u64 },
    /// The value could not be encoded, so its size is unknown. Nothing changed.
    Unserializable,
}

impl SetOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

struct Node<V> {
    entry: CacheEntry<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded-size, bounded-age LRU cache.
pub struct MemoryCache<V> {
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    current_size: u64,
    max_size: u64,
    max_age_ms: u64,
    clock: Arc<dyn Clock>,
    hits: u64,
    misses: u64,
    evictions: u64,
    on_evict: Option<EvictionListener<V>>,
}

impl<V: CacheValue> MemoryCache<V> {
    /// Create an empty cache.
    pub fn new(config: &MemoryTierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            current_size: 0,
            max_size: config.max_size_bytes,
            max_age_ms: config.max_age.as_millis() as u64,
            clock,
            hits: 0,
            misses: 0,
            evictions: 0,
            on_evict: None,
        }
    }

    /// Register the eviction callback, replacing any previous one.
    pub fn set_eviction_listener(&mut self, listener: EvictionListener<V>) {
        self.on_evict = Some(listener);
    }

    /// Look up a value, promoting it to most recently used.
    pub fn get(&mut self, key: &str) -> Option<V> {
        self.get_entry(key).map(|entry| entry.value.clone())
    }

    /// Look up an entry, promoting it to most recently used.
    ///
    /// A stale entry is removed and reported as a miss. Stale removal is not
    /// an eviction and does not reach the eviction listener.
    pub fn get_entry(&mut self, key: &str) -> Option<&CacheEntry<V>> {
        let Some(&idx) = self.index.get(key) else {
            self.misses += 1;
            return None;
        };

        let now = self.clock.now_ms();
        let expired = self
            .slot(idx)
            .map(|node| node.entry.is_expired(now, self.max_age_ms))
            .unwrap_or(true);

        if expired {
            self.remove_slot(idx);
            self.misses += 1;
            return None;
        }

        self.unlink(idx);
        self.push_front(idx);
        self.hits += 1;

        let node = self.slot_mut(idx)?;
        node.entry.hit_count = node.entry.hit_count.saturating_add(1);
        Some(&node.entry)
    }

    /// Read an entry without touching recency or statistics.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        let idx = *self.index.get(key)?;
        let node = self.slot(idx)?;
        if node.entry.is_expired(self.clock.now_ms(), self.max_age_ms) {
            None
        } else {
            Some(&node.entry)
        }
    }

    /// Insert or replace a value, sizing it by its canonical encoding.
    pub fn set(&mut self, key: &str, value: V, metadata: EntryMetadata) -> SetOutcome {
        match encode_value(key, &value) {
            Ok(bytes) => self.insert_sized(key, value, bytes.len() as u64, metadata.etag),
            Err(e) => {
                tracing::debug!(key, error = %e, "memory tier skipped unserializable value");
                SetOutcome::Unserializable
            }
        }
    }

    /// Insert or replace a value whose encoded size is already known.
    ///
    /// Used when the caller has just encoded the value for the disk tier.
    pub fn insert_sized(
        &mut self,
        key: &str,
        value: V,
        size_bytes: u64,
        etag: Option<String>,
    ) -> SetOutcome {
        if size_bytes > self.max_size {
            return SetOutcome::Oversized { size_bytes };
        }

        if let Some(&idx) = self.index.get(key) {
            self.remove_slot(idx);
        }

        let mut evicted = 0;
        while self.current_size + size_bytes > self.max_size {
            let Some(tail) = self.tail else { break };
            let Some(entry) = self.remove_slot(tail) else { break };

            self.evictions += 1;
            evicted += 1;
            tracing::debug!(key = %entry.key, bytes = entry.size_bytes, "memory tier evicted");
            if let Some(listener) = self.on_evict.as_mut() {
                listener(&entry);
            }
        }

        let entry = CacheEntry::new(key, value, self.clock.now_ms(), size_bytes, etag);
        let idx = self.alloc(Node {
            entry,
            prev: None,
            next: None,
        });
        self.index.insert(key.to_string(), idx);
        self.push_front(idx);
        self.current_size += size_bytes;

        SetOutcome::Stored { evicted }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&idx) => self.remove_slot(idx).is_some(),
            None => false,
        }
    }

    /// Remove every key matching `pattern`. O(n) in the number of entries.
    pub fn remove_matching(&mut self, pattern: &Regex) -> usize {
        let doomed: Vec<usize> = self
            .index
            .iter()
            .filter(|(key, _)| pattern.is_match(key))
            .map(|(_, &idx)| idx)
            .collect();

        doomed
            .into_iter()
            .filter(|&idx| self.remove_slot(idx).is_some())
            .count()
    }

    /// Drop every stale entry. Returns how many were removed.
    pub fn evict_expired(&mut self) -> usize {
        let now = self.clock.now_ms();
        let max_age_ms = self.max_age_ms;
        let stale: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&idx| {
                self.slot(idx)
                    .map(|node| node.entry.is_expired(now, max_age_ms))
                    .unwrap_or(false)
            })
            .collect();

        stale
            .into_iter()
            .filter(|&idx| self.remove_slot(idx).is_some())
            .count()
    }

    /// Remove everything. Statistics are kept.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.current_size = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.slot(idx) else { break };
            keys.push(node.entry.key.clone());
            cursor = node.next;
        }
        keys
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            current_size: self.current_size,
            max_size: self.max_size,
            entry_count: self.index.len() as u64,
        }
    }

    // ------------------------------------------------------------------------
    // Arena and list plumbing
    // ------------------------------------------------------------------------

    fn slot(&self, idx: usize) -> Option<&Node<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Detach `idx` from the list. Handles head, tail and middle nodes.
    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.slot(idx).map(|node| (node.prev, node.next)) else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slot_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(n) => {
                if let Some(node) = self.slot_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.slot_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slot_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }

        match old_head {
            Some(h) => {
                if let Some(node) = self.slot_mut(h) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }

        self.head = Some(idx);
    }

    /// Unlink, free the slot and drop the key from the index.
    fn remove_slot(&mut self, idx: usize) -> Option<CacheEntry<V>> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.index.remove(&node.entry.key);
        self.current_size = self.current_size.saturating_sub(node.entry.size_bytes);
        Some(node.entry)
    }
}
