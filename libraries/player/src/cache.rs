//! Byte-budgeted chunk cache with FIFO eviction.
//!
//! Entries are billed at their chunk's on-disk span rather than the
//! decoded size, so the budget stays predictable across compression
//! ratios. Insertion order is the eviction order, which keeps prefetch
//! order temporally meaningful.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bagplay_format::RosbagMessage;

pub const DEFAULT_CACHE_BYTES: u64 = 50 * 1024 * 1024;

/// The decoded messages of one chunk.
#[derive(Debug, Clone)]
pub struct ChunkCacheEntry {
    pub messages: Arc<Vec<RosbagMessage>>,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct ChunkCache {
    entries: HashMap<usize, ChunkCacheEntry>,
    order: VecDeque<usize>,
    current_bytes: u64,
    max_bytes: u64,
}

impl ChunkCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            current_bytes: 0,
            max_bytes,
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.entries.contains_key(&idx)
    }

    pub fn get(&self, idx: usize) -> Option<&ChunkCacheEntry> {
        self.entries.get(&idx)
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// Inserts an entry and evicts oldest entries until the budget holds.
    pub fn insert(&mut self, idx: usize, entry: ChunkCacheEntry) {
        self.current_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(idx, entry) {
            self.current_bytes -= old.size_bytes;
        } else {
            self.order.push_back(idx);
        }
        while self.current_bytes > self.max_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.current_bytes -= evicted.size_bytes;
                tracing::debug!(
                    chunk = oldest,
                    bytes = evicted.size_bytes,
                    "evicted chunk from cache"
                );
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.current_bytes = 0;
    }
}
