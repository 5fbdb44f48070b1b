//! Byte-budgeted LRU cache for fetched chunks.
//!
//! The cache is the shared surface between the range server and the prefetch
//! workers. Eviction is driven by bytes, not entry count: inserting past the
//! budget pops least-recently-used entries until the new chunk fits.

use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

/// Key identifying one chunk of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    /// Stream the chunk belongs to
    pub stream_id: Arc<str>,
    /// Zero-based chunk index within the stream
    pub chunk_index: u64,
}

impl ChunkKey {
    /// Creates a key for `chunk_index` of `stream_id`.
    pub fn new(stream_id: Arc<str>, chunk_index: u64) -> Self {
        Self {
            stream_id,
            chunk_index,
        }
    }
}

struct CacheInner {
    entries: LruCache<ChunkKey, Bytes>,
    used_bytes: usize,
}

/// LRU cache of chunk payloads under a hard byte budget.
///
/// All operations are linearizable: a single async mutex guards the entry
/// map and the byte counter together.
pub struct ChunkCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    /// Creates a cache with the given byte budget.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
            }),
        }
    }

    /// Returns the chunk and promotes it to most-recently-used.
    pub async fn get(&self, key: &ChunkKey) -> Option<Bytes> {
        let mut inner = self.inner.lock().await;
        inner.entries.get(key).cloned()
    }

    /// Whether the chunk is resident. Does not affect recency.
    pub async fn contains(&self, key: &ChunkKey) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.contains(key)
    }

    /// Stores a chunk, evicting least-recently-used entries until it fits.
    ///
    /// Replacing an existing key reclaims the prior entry's size first.
    /// An entry larger than the whole budget is silently rejected; in
    /// practice a chunk never exceeds the configured chunk size.
    pub async fn insert(&self, key: ChunkKey, data: Bytes) {
        if data.len() > self.max_bytes {
            debug!(
                stream = %key.stream_id,
                chunk = key.chunk_index,
                size = data.len(),
                "rejecting cache entry larger than the whole budget"
            );
            return;
        }

        let mut inner = self.inner.lock().await;
        if let Some(prior) = inner.entries.pop(&key) {
            inner.used_bytes -= prior.len();
        }
        while inner.used_bytes + data.len() > self.max_bytes {
            let Some((evicted_key, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used_bytes -= evicted.len();
            debug!(
                stream = %evicted_key.stream_id,
                chunk = evicted_key.chunk_index,
                "evicted chunk to stay within cache budget"
            );
        }
        inner.used_bytes += data.len();
        inner.entries.put(key, data);
    }

    /// Removes every entry belonging to `stream_id`.
    pub async fn delete_prefix(&self, stream_id: &str) {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<ChunkKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| &*key.stream_id == stream_id)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = doomed.len();
        for key in doomed {
            if let Some(data) = inner.entries.pop(&key) {
                inner.used_bytes -= data.len();
            }
        }
        debug!(stream = stream_id, removed, "purged cached chunks for stream");
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.used_bytes = 0;
    }

    /// Bytes currently resident.
    pub async fn used_bytes(&self) -> usize {
        self.inner.lock().await.used_bytes
    }

    /// Entries currently resident.
    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stream: &str, index: u64) -> ChunkKey {
        ChunkKey::new(Arc::from(stream), index)
    }

    fn payload(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[tokio::test]
    async fn test_get_returns_inserted_bytes() {
        let cache = ChunkCache::new(1024);
        let data = payload(10, 1);

        assert!(cache.get(&key("s", 0)).await.is_none());
        cache.insert(key("s", 0), data.clone()).await;
        assert_eq!(cache.get(&key("s", 0)).await.unwrap(), data);
        assert_eq!(cache.used_bytes().await, 10);
    }

    #[tokio::test]
    async fn test_budget_is_never_exceeded() {
        let cache = ChunkCache::new(100);

        for index in 0..20 {
            cache.insert(key("s", index), payload(30, index as u8)).await;
            assert!(cache.used_bytes().await <= 100);
        }
        // 3 entries of 30 bytes fit; a fourth would burst the budget.
        assert_eq!(cache.entry_count().await, 3);
    }

    #[tokio::test]
    async fn test_eviction_is_oldest_first() {
        let cache = ChunkCache::new(100);
        cache.insert(key("s", 0), payload(40, 0)).await;
        cache.insert(key("s", 1), payload(40, 1)).await;
        cache.insert(key("s", 2), payload(40, 2)).await;

        assert!(!cache.contains(&key("s", 0)).await);
        assert!(cache.contains(&key("s", 1)).await);
        assert!(cache.contains(&key("s", 2)).await);
    }

    #[tokio::test]
    async fn test_get_promotes_to_most_recent() {
        let cache = ChunkCache::new(100);
        cache.insert(key("s", 0), payload(40, 0)).await;
        cache.insert(key("s", 1), payload(40, 1)).await;

        // Touch 0 so 1 becomes the eviction candidate.
        cache.get(&key("s", 0)).await.unwrap();
        cache.insert(key("s", 2), payload(40, 2)).await;

        assert!(cache.contains(&key("s", 0)).await);
        assert!(!cache.contains(&key("s", 1)).await);
    }

    #[tokio::test]
    async fn test_contains_does_not_promote() {
        let cache = ChunkCache::new(100);
        cache.insert(key("s", 0), payload(40, 0)).await;
        cache.insert(key("s", 1), payload(40, 1)).await;

        // contains() must leave 0 as the eviction candidate.
        assert!(cache.contains(&key("s", 0)).await);
        cache.insert(key("s", 2), payload(40, 2)).await;

        assert!(!cache.contains(&key("s", 0)).await);
        assert!(cache.contains(&key("s", 1)).await);
    }

    #[tokio::test]
    async fn test_replacing_reclaims_prior_size() {
        let cache = ChunkCache::new(100);
        cache.insert(key("s", 0), payload(60, 0)).await;
        cache.insert(key("s", 0), payload(80, 1)).await;

        assert_eq!(cache.used_bytes().await, 80);
        assert_eq!(cache.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_rejected_silently() {
        let cache = ChunkCache::new(50);
        cache.insert(key("s", 0), payload(51, 0)).await;

        assert!(!cache.contains(&key("s", 0)).await);
        assert_eq!(cache.used_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_delete_prefix_only_touches_one_stream() {
        let cache = ChunkCache::new(1024);
        for index in 0..4 {
            cache.insert(key("a", index), payload(10, 1)).await;
            cache.insert(key("b", index), payload(10, 2)).await;
        }

        cache.delete_prefix("a").await;

        for index in 0..4 {
            assert!(!cache.contains(&key("a", index)).await);
            assert!(cache.contains(&key("b", index)).await);
        }
        assert_eq!(cache.used_bytes().await, 40);
    }

    #[tokio::test]
    async fn test_clear_resets_usage() {
        let cache = ChunkCache::new(1024);
        cache.insert(key("s", 0), payload(10, 0)).await;
        cache.clear().await;

        assert_eq!(cache.used_bytes().await, 0);
        assert_eq!(cache.entry_count().await, 0);
    }
}
