//! LRU embedding cache with zero-copy sharing via Arc<[f32]>
//!
//! Capacity is counted in entries (default 1024). Values are shared as
//! `Arc<[f32]>` so a cache hit is a pointer copy, not a vector clone.
//! Hit/miss counters are atomic; the map itself sits behind a mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Statistics for the embedding cache
#[derive(Debug, Clone)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    /// Hit rate as percentage (0.0 - 100.0)
    pub hit_rate: f64,
}

struct Entry {
    embedding: Arc<[f32]>,
    /// Monotonic access stamp; smallest stamp is the eviction victim
    last_used: u64,
}

struct CacheState {
    entries: HashMap<String, Entry>,
    clock: u64,
}

/// Thread-safe LRU cache keyed by the SHA-256 of the embedded text
pub struct EmbeddingCache {
    state: Mutex<CacheState>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` embeddings.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get an embedding. Returns an Arc clone (cheap pointer copy).
    pub fn get(&self, key: &str) -> Option<Arc<[f32]>> {
        let mut state = self.state.lock();
        state.clock += 1;
        let stamp = state.clock;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = stamp;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.embedding.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an embedding, evicting the least recently used entry when full.
    pub fn put(&self, key: String, embedding: Vec<f32>) {
        let mut state = self.state.lock();
        state.clock += 1;
        let stamp = state.clock;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.capacity {
            if let Some(victim) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&victim);
            }
        }

        state.entries.insert(
            key,
            Entry {
                embedding: embedding.into(),
                last_used: stamp,
            },
        );
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        let state = self.state.lock();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        EmbeddingCacheStats {
            hits,
            misses,
            entries: state.entries.len(),
            capacity: self.capacity,
            hit_rate: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Drop every entry. Hit/miss counters are cumulative and survive.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
