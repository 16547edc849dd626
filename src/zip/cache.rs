//! Byte-budgeted cache of decompressed entry content.
//!
//! Entries only keep a [`Weak`](std::sync::Weak) handle to their decompressed
//! buffer; the strong reference lives here. Once evicted, a buffer survives only as
//! long as some reader still holds it, after which the entry decompresses again.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::io::SegmentedBuffer;

struct Inner {
    lru: LruCache<u64, Arc<SegmentedBuffer>>,
    bytes: u64,
}

pub struct DecompressionCache {
    inner: Mutex<Inner>,
    budget: u64,
}

impl DecompressionCache {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            budget,
        }
    }

    /// Keep `buffer` alive under `key`, evicting least recently used buffers until
    /// the budget holds. Returns false when the buffer alone exceeds the budget.
    pub fn insert(&self, key: u64, buffer: Arc<SegmentedBuffer>) -> bool {
        let size = buffer.len();
        if size > self.budget {
            debug!(key, size, budget = self.budget, "content too large to cache");
            return false;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(key, buffer) {
            inner.bytes -= old.len();
        }
        inner.bytes += size;
        while inner.bytes > self.budget {
            let Some((evicted, old)) = inner.lru.pop_lru() else {
                break;
            };
            inner.bytes -= old.len();
            debug!(key = evicted, size = old.len(), "evicted decompressed content");
        }
        true
    }

    /// Mark `key` as recently used.
    pub fn touch(&self, key: u64) {
        self.inner.lock().lru.get(&key);
    }

    pub fn remove(&self, key: u64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.pop(&key) {
            inner.bytes -= old.len();
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bytes = 0;
    }

    pub fn contains(&self, key: u64) -> bool {
        self.inner.lock().lru.contains(&key)
    }

    /// Bytes currently held.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }
}

impl std::fmt::Debug for DecompressionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DecompressionCache")
            .field("entries", &inner.lru.len())
            .field("bytes", &inner.bytes)
            .field("budget", &self.budget)
            .finish()
    }
}
