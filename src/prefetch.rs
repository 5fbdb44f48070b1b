//! Background prefetching ahead of the playback cursor.
//!
//! Each stream owns a set of long-lived workers that keep pulling the next
//! uncached, not-in-flight chunk ahead of the position the range server last
//! reported, up to a lookahead bound. The cursor increment doubles as the
//! reservation, so no two workers ever fetch the same index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::cache::ChunkCache;
use crate::config::StreamConfig;
use crate::fetch::{ChunkFetcher, InflightRegistry, StreamSource};

struct CursorState {
    playback_chunk: u64,
    cursor: u64,
    seek_generation: u64,
}

struct EngineInner {
    source: StreamSource,
    total_chunks: u64,
    fetcher: Arc<ChunkFetcher>,
    cache: Arc<ChunkCache>,
    inflight: Arc<InflightRegistry>,
    worker_count: usize,
    lookahead: u64,
    cooldown: Duration,
    state: Mutex<CursorState>,
    running: AtomicBool,
}

impl EngineInner {
    fn state_lock(&self) -> MutexGuard<'_, CursorState> {
        self.state.lock().expect("prefetch cursor lock poisoned")
    }

    /// Reserves the next chunk index worth fetching, or `None` when the
    /// window ahead of playback is already covered.
    ///
    /// The cursor bump happens inside the critical section, so the returned
    /// index belongs to this caller alone; the cache and registry probes
    /// that follow only decide whether the reserved index still needs work.
    async fn next_chunk(&self) -> Option<u64> {
        let mut scanned = 0u64;
        while scanned < self.lookahead {
            let candidate = {
                let mut state = self.state_lock();
                let limit = state.playback_chunk.saturating_add(self.lookahead);
                if state.cursor >= self.total_chunks || state.cursor > limit {
                    return None;
                }
                let index = state.cursor;
                state.cursor += 1;
                index
            };
            scanned += 1;

            let key = self.source.chunk_key(candidate);
            if !self.cache.contains(&key).await && !self.inflight.contains(&key) {
                return Some(candidate);
            }
        }
        None
    }
}

async fn worker_loop(inner: Arc<EngineInner>, worker: usize) {
    debug!(stream = %inner.source.stream_id, worker, "prefetch worker started");
    while inner.running.load(Ordering::Acquire) {
        let generation = inner.state_lock().seek_generation;

        let Some(chunk_index) = inner.next_chunk().await else {
            sleep(inner.cooldown).await;
            continue;
        };

        // Failures were already retried inside the fetcher; nothing useful
        // to do with them here.
        let _ = inner.fetcher.fetch(&inner.source, chunk_index).await;

        if inner.state_lock().seek_generation != generation {
            // The cursor moved elsewhere while we were downloading.
            continue;
        }
        sleep(inner.cooldown).await;
    }
    debug!(stream = %inner.source.stream_id, worker, "prefetch worker exiting");
}

/// Per-stream worker pool that fills the cache ahead of playback.
pub struct PrefetchEngine {
    inner: Arc<EngineInner>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PrefetchEngine {
    /// Creates an engine for `source` over the shared fetch machinery.
    pub fn new(
        source: StreamSource,
        fetcher: Arc<ChunkFetcher>,
        cache: Arc<ChunkCache>,
        inflight: Arc<InflightRegistry>,
        config: &StreamConfig,
    ) -> Self {
        let total_chunks = source.total_chunks(config.chunk_size);
        Self {
            inner: Arc::new(EngineInner {
                source,
                total_chunks,
                fetcher,
                cache,
                inflight,
                worker_count: config.parallel_workers,
                lookahead: config.lookahead_chunks,
                cooldown: config.worker_cooldown,
                state: Mutex::new(CursorState {
                    playback_chunk: 0,
                    cursor: 0,
                    seek_generation: 0,
                }),
                running: AtomicBool::new(false),
            }),
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Positions the cursor and launches the worker set.
    pub async fn start(&self, from_chunk: u64) {
        {
            let mut state = self.inner.state_lock();
            state.cursor = from_chunk.min(self.inner.total_chunks);
        }
        self.inner.running.store(true, Ordering::Release);

        let mut workers = self.workers.lock().await;
        for worker in 0..self.inner.worker_count {
            workers.push(tokio::spawn(worker_loop(Arc::clone(&self.inner), worker)));
        }
        debug!(
            stream = %self.inner.source.stream_id,
            workers = self.inner.worker_count,
            from_chunk,
            "prefetch engine started"
        );
    }

    /// Records the playback position reported by the range server.
    ///
    /// When the cursor has drifted past end of stream or further than the
    /// lookahead bound ahead of playback, it is pulled back to the playback
    /// position under a fresh seek generation.
    pub fn notify_playback(&self, chunk_index: u64) {
        let mut state = self.inner.state_lock();
        state.playback_chunk = chunk_index;

        let drifted = state.cursor >= self.inner.total_chunks
            || state.cursor > chunk_index.saturating_add(self.inner.lookahead);
        if drifted {
            state.seek_generation += 1;
            state.cursor = chunk_index;
            debug!(
                stream = %self.inner.source.stream_id,
                chunk = chunk_index,
                generation = state.seek_generation,
                "prefetch cursor repositioned to playback"
            );
        }
    }

    /// Repositions both playback position and cursor for an explicit seek.
    pub fn seek_to(&self, chunk_index: u64) {
        let mut state = self.inner.state_lock();
        state.playback_chunk = chunk_index;
        state.cursor = chunk_index;
        state.seek_generation += 1;
        debug!(
            stream = %self.inner.source.stream_id,
            chunk = chunk_index,
            generation = state.seek_generation,
            "prefetch engine seeking"
        );
    }

    /// Stops the workers and waits for them to exit.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
        debug!(stream = %self.inner.source.stream_id, "prefetch engine stopped");
    }

    /// Whether the worker set is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Next index the engine will try to reserve.
    pub fn cursor_position(&self) -> u64 {
        self.inner.state_lock().cursor
    }

    /// Monotonic counter bumped by every reposition.
    pub fn generation(&self) -> u64 {
        self.inner.state_lock().seek_generation
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::MillraceConfig;
    use crate::remote::{ApiCredentials, RemoteStore, SimulatedDocument, SimulatedStore};
    use crate::session::{CredentialStore, SessionPool};

    const CHUNK: usize = 64 * 1024;

    struct Fixture {
        engine: PrefetchEngine,
        cache: Arc<ChunkCache>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(total_chunks: u64, config: &StreamConfig) -> Fixture {
        let store = Arc::new(SimulatedStore::new());
        store.insert_document(
            1,
            1,
            SimulatedDocument::new(5, total_chunks * CHUNK as u64, "video/mp4", "pf"),
        );

        let dir = tempfile::tempdir().unwrap();
        let base = MillraceConfig::for_testing();
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            CredentialStore::new(dir.path().join("session.json")),
            base.pool.clone(),
        ));
        pool.ensure_pool(
            &ApiCredentials {
                api_id: 1,
                api_hash: "h".to_string(),
                bot_token: "t".to_string(),
            },
            2,
        )
        .await
        .unwrap();

        let session = pool.any_connected().await.unwrap();
        let info = session.resolve_document(1, 1).await.unwrap();

        let cache = Arc::new(ChunkCache::new(256 * 1024 * 1024));
        let inflight = Arc::new(InflightRegistry::new());
        let fetcher = Arc::new(ChunkFetcher::new(
            pool,
            Arc::clone(&cache),
            Arc::clone(&inflight),
            CHUNK,
            base.fetch.clone(),
        ));
        let source = StreamSource::new("pf", info.handle, info.dc_id, info.file_size);
        let engine = PrefetchEngine::new(source, fetcher, Arc::clone(&cache), inflight, config);

        Fixture {
            engine,
            cache,
            _dir: dir,
        }
    }

    fn small_stream_config() -> StreamConfig {
        let mut config = MillraceConfig::for_testing().stream;
        config.chunk_size = CHUNK;
        config
    }

    #[tokio::test]
    async fn test_reservations_are_unique_across_workers() {
        let fx = fixture(64, &small_stream_config()).await;
        let inner = Arc::clone(&fx.engine.inner);
        {
            let mut state = inner.state_lock();
            state.playback_chunk = 0;
            state.cursor = 0;
        }
        // Pretend everything is eligible; the lookahead window covers 0..=16.
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                let mut reserved = Vec::new();
                while let Some(index) = inner.next_chunk().await {
                    reserved.push(index);
                }
                reserved
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for index in task.await.unwrap() {
                assert!(seen.insert(index), "index {index} reserved twice");
            }
        }
        assert!(!seen.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_advances_monotonically_between_seeks() {
        let fx = fixture(64, &small_stream_config()).await;
        let inner = Arc::clone(&fx.engine.inner);

        let mut last = 0;
        for _ in 0..5 {
            let index = inner.next_chunk().await.unwrap();
            assert!(index >= last);
            last = index;
            assert_eq!(fx.engine.cursor_position(), index + 1);
        }
    }

    #[tokio::test]
    async fn test_seek_repositions_cursor_and_bumps_generation() {
        let fx = fixture(64, &small_stream_config()).await;

        let before = fx.engine.generation();
        fx.engine.seek_to(40);
        assert_eq!(fx.engine.cursor_position(), 40);
        assert_eq!(fx.engine.generation(), before + 1);
    }

    #[tokio::test]
    async fn test_notify_playback_repositions_only_on_drift() {
        let config = small_stream_config();
        let fx = fixture(1024, &config).await;

        // Cursor right at playback: no reposition.
        fx.engine.notify_playback(0);
        let generation = fx.engine.generation();
        assert_eq!(generation, 0);

        // Drag the cursor far past the lookahead window.
        {
            let mut state = fx.engine.inner.state_lock();
            state.cursor = config.lookahead_chunks + 100;
        }
        fx.engine.notify_playback(1);
        assert_eq!(fx.engine.generation(), generation + 1);
        assert_eq!(fx.engine.cursor_position(), 1);
    }

    #[tokio::test]
    async fn test_workers_fill_cache_and_stop() {
        let mut config = small_stream_config();
        config.parallel_workers = 4;
        let fx = fixture(12, &config).await;

        fx.engine.start(0).await;
        assert!(fx.engine.is_running());

        // 12 chunks at worker cooldown pace arrive well within a second.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if fx.cache.entry_count().await == 12 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "prefetch did not fill the cache in time"
            );
            sleep(Duration::from_millis(10)).await;
        }

        fx.engine.stop().await;
        assert!(!fx.engine.is_running());
    }
}
