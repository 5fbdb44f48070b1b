//! Chunk fetching with retry, session rotation, and in-flight deduplication.
//!
//! The fetcher is the sole writer into the cache and the sole participant in
//! the in-flight registry: the range server and the prefetch workers both
//! resolve chunks through [`ChunkFetcher::fetch`], so concurrent interest in
//! the same chunk collapses onto a single remote download.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::{ChunkCache, ChunkKey};
use crate::config::FetchConfig;
use crate::remote::{DocumentHandle, RemoteError};
use crate::session::SessionPool;

/// Terminal outcome of a chunk fetch: bytes on success, `None` when all
/// retries were exhausted.
pub type ChunkOutcome = Option<Bytes>;

/// Receiver half of an in-flight completion.
pub type OutcomeReceiver = watch::Receiver<Option<ChunkOutcome>>;

/// Coordinates of one stream's remote document, shared by every component
/// that fetches chunks for it.
#[derive(Debug, Clone)]
pub struct StreamSource {
    /// Identifier the stream is registered under
    pub stream_id: Arc<str>,
    /// Remote document handle used for downloads
    pub handle: DocumentHandle,
    /// Data center the document is pinned to
    pub dc_id: i32,
    /// Total stream length in bytes
    pub file_size: u64,
}

impl StreamSource {
    /// Creates a source for `stream_id` over the given document.
    pub fn new(
        stream_id: impl Into<Arc<str>>,
        handle: DocumentHandle,
        dc_id: i32,
        file_size: u64,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            handle,
            dc_id,
            file_size,
        }
    }

    /// Number of chunks the stream spans at the given chunk size.
    pub fn total_chunks(&self, chunk_size: usize) -> u64 {
        self.file_size.div_ceil(chunk_size as u64)
    }

    /// Cache/in-flight key for one chunk of this stream.
    pub fn chunk_key(&self, chunk_index: u64) -> ChunkKey {
        ChunkKey::new(Arc::clone(&self.stream_id), chunk_index)
    }
}

/// Registry of fetches currently on the wire, keyed by chunk.
///
/// The first arrival on a key claims it and later publishes the outcome;
/// every subsequent arrival joins the existing completion instead of issuing
/// its own download. The claim deregisters the key even when the claiming
/// task is cancelled, so joiners never wait forever.
pub struct InflightRegistry {
    entries: Mutex<HashMap<ChunkKey, OutcomeReceiver>>,
}

/// Result of [`InflightRegistry::begin`].
pub enum FetchTicket {
    /// The caller owns the fetch and must complete the claim
    Claimed(FetchClaim),
    /// Another task owns the fetch; await its outcome
    Joined(OutcomeReceiver),
}

impl InflightRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claims `key` if nobody holds it, otherwise joins the existing fetch.
    pub fn begin(self: Arc<Self>, key: ChunkKey) -> FetchTicket {
        let mut entries = self.entries_lock();
        if let Some(receiver) = entries.get(&key) {
            return FetchTicket::Joined(receiver.clone());
        }
        let (sender, receiver) = watch::channel(None);
        entries.insert(key.clone(), receiver);
        drop(entries);
        FetchTicket::Claimed(FetchClaim {
            registry: self,
            key,
            sender: Some(sender),
        })
    }

    /// Whether a fetch for `key` is currently on the wire.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries_lock().contains_key(key)
    }

    /// Number of fetches currently on the wire.
    pub fn len(&self) -> usize {
        self.entries_lock().len()
    }

    /// Whether no fetch is currently on the wire.
    pub fn is_empty(&self) -> bool {
        self.entries_lock().is_empty()
    }

    fn entries_lock(&self) -> MutexGuard<'_, HashMap<ChunkKey, OutcomeReceiver>> {
        self.entries.lock().expect("in-flight registry lock poisoned")
    }

    fn finish(&self, key: &ChunkKey, sender: &watch::Sender<Option<ChunkOutcome>>, outcome: ChunkOutcome) {
        self.entries_lock().remove(key);
        sender.send_replace(Some(outcome));
    }
}

impl Default for InflightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive claim on an in-flight key.
///
/// Dropping the claim without calling [`FetchClaim::complete`] publishes a
/// failure, so waiters observe completion even if the claimer is cancelled.
pub struct FetchClaim {
    registry: Arc<InflightRegistry>,
    key: ChunkKey,
    sender: Option<watch::Sender<Option<ChunkOutcome>>>,
}

impl FetchClaim {
    /// Publishes the outcome and deregisters the key.
    pub fn complete(mut self, outcome: ChunkOutcome) {
        if let Some(sender) = self.sender.take() {
            self.registry.finish(&self.key, &sender, outcome);
        }
    }
}

impl Drop for FetchClaim {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            self.registry.finish(&self.key, &sender, None);
        }
    }
}

/// Awaits the outcome published by whoever owns the fetch.
pub async fn await_outcome(mut receiver: OutcomeReceiver) -> ChunkOutcome {
    loop {
        let settled = receiver.borrow().clone();
        if let Some(outcome) = settled {
            return outcome;
        }
        if receiver.changed().await.is_err() {
            // Sender vanished; the drop path publishes a failure first, so
            // whatever the channel last held is the final word.
            return receiver.borrow().clone().flatten();
        }
    }
}

/// Resolves chunks from the remote store through the session pool.
pub struct ChunkFetcher {
    pool: Arc<SessionPool>,
    cache: Arc<ChunkCache>,
    inflight: Arc<InflightRegistry>,
    chunk_size: usize,
    config: FetchConfig,
}

impl ChunkFetcher {
    /// Creates a fetcher over the shared pool, cache, and registry.
    pub fn new(
        pool: Arc<SessionPool>,
        cache: Arc<ChunkCache>,
        inflight: Arc<InflightRegistry>,
        chunk_size: usize,
        config: FetchConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            inflight,
            chunk_size,
            config,
        }
    }

    /// Bytes per chunk this fetcher downloads.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Resolves one chunk: cache first, in-flight join second, download last.
    ///
    /// Returns the chunk bytes, empty bytes when the chunk offset is at or
    /// past end of file, or `None` once all retries are exhausted. Transport
    /// errors never escape; they are logged and converted into retries.
    pub async fn fetch(&self, source: &StreamSource, chunk_index: u64) -> ChunkOutcome {
        let offset = chunk_index.saturating_mul(self.chunk_size as u64);
        if offset >= source.file_size {
            return Some(Bytes::new());
        }

        let key = source.chunk_key(chunk_index);
        if let Some(bytes) = self.cache.get(&key).await {
            return Some(bytes);
        }

        match Arc::clone(&self.inflight).begin(key.clone()) {
            FetchTicket::Joined(receiver) => await_outcome(receiver).await,
            FetchTicket::Claimed(claim) => {
                let outcome = self.download_with_retry(source, chunk_index, offset).await;
                if let Some(bytes) = outcome.clone() {
                    self.cache.insert(key, bytes).await;
                }
                claim.complete(outcome.clone());
                outcome
            }
        }
    }

    async fn download_with_retry(
        &self,
        source: &StreamSource,
        chunk_index: u64,
        offset: u64,
    ) -> ChunkOutcome {
        for attempt in 1..=self.config.max_retries {
            match self.attempt_download(source, chunk_index, offset, attempt).await {
                Ok(bytes) if !bytes.is_empty() => {
                    debug!(
                        stream = %source.stream_id,
                        chunk = chunk_index,
                        attempt,
                        size = bytes.len(),
                        "chunk downloaded"
                    );
                    return Some(bytes);
                }
                Ok(_) => {
                    warn!(
                        stream = %source.stream_id,
                        chunk = chunk_index,
                        attempt,
                        "remote returned no bytes for chunk"
                    );
                }
                Err(error) => {
                    warn!(
                        stream = %source.stream_id,
                        chunk = chunk_index,
                        attempt,
                        %error,
                        "chunk download attempt failed"
                    );
                }
            }
            if attempt < self.config.max_retries {
                sleep(self.config.backoff_base * 2u32.pow(attempt - 1)).await;
            }
        }
        warn!(
            stream = %source.stream_id,
            chunk = chunk_index,
            retries = self.config.max_retries,
            "chunk download failed after all retries"
        );
        None
    }

    async fn attempt_download(
        &self,
        source: &StreamSource,
        chunk_index: u64,
        offset: u64,
        attempt: u32,
    ) -> Result<Bytes, RemoteError> {
        // Rotate to a different pool slot on every retry.
        let session = self
            .pool
            .acquire(chunk_index + u64::from(attempt) - 1)
            .await?;
        session
            .download_chunk(&source.handle, source.dc_id, offset, self.chunk_size)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MillraceConfig;
    use crate::remote::{
        ApiCredentials, RemoteStore, SimulatedDocument, SimulatedStore, deterministic_chunk,
    };
    use crate::session::CredentialStore;

    const CHUNK: usize = 64 * 1024;
    const DOC_ID: i64 = 42;
    const FILE_SIZE: u64 = 10 * CHUNK as u64 + 1234;

    struct Fixture {
        store: Arc<SimulatedStore>,
        fetcher: Arc<ChunkFetcher>,
        cache: Arc<ChunkCache>,
        inflight: Arc<InflightRegistry>,
        source: StreamSource,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SimulatedStore::new());
        store.insert_document(
            1,
            1,
            SimulatedDocument::new(DOC_ID, FILE_SIZE, "video/mp4", "fetch-seed"),
        );

        let dir = tempfile::tempdir().unwrap();
        let config = MillraceConfig::for_testing();
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            CredentialStore::new(dir.path().join("session.json")),
            config.pool.clone(),
        ));
        let api = ApiCredentials {
            api_id: 1,
            api_hash: "h".to_string(),
            bot_token: "t".to_string(),
        };
        pool.ensure_pool(&api, 2).await.unwrap();

        let session = pool.any_connected().await.unwrap();
        let info = session.resolve_document(1, 1).await.unwrap();

        let cache = Arc::new(ChunkCache::new(64 * 1024 * 1024));
        let inflight = Arc::new(InflightRegistry::new());
        let fetcher = Arc::new(ChunkFetcher::new(
            pool,
            Arc::clone(&cache),
            Arc::clone(&inflight),
            CHUNK,
            config.fetch.clone(),
        ));
        let source = StreamSource::new("s", info.handle, info.dc_id, info.file_size);

        Fixture {
            store,
            fetcher,
            cache,
            inflight,
            source,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_fetch_hits_remote_once_then_cache() {
        let fx = fixture().await;

        let first = fx.fetcher.fetch(&fx.source, 3).await.unwrap();
        assert_eq!(first, deterministic_chunk("fetch-seed", 3, FILE_SIZE, CHUNK));
        assert_eq!(fx.store.downloads_for_chunk(DOC_ID, 3, CHUNK), 1);

        let second = fx.fetcher.fetch(&fx.source, 3).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(fx.store.downloads_for_chunk(DOC_ID, 3, CHUNK), 1);
    }

    #[tokio::test]
    async fn test_offset_past_end_returns_empty_without_rpc() {
        let fx = fixture().await;

        let bytes = fx.fetcher.fetch(&fx.source, 1000).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(fx.store.download_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetchers_coalesce_onto_one_rpc() {
        let fx = fixture().await;
        fx.store.set_download_delay(std::time::Duration::from_millis(30));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let fetcher = Arc::clone(&fx.fetcher);
            let source = fx.source.clone();
            tasks.push(tokio::spawn(async move { fetcher.fetch(&source, 5).await }));
        }

        let expected = deterministic_chunk("fetch-seed", 5, FILE_SIZE, CHUNK);
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), expected);
        }
        assert_eq!(fx.store.downloads_for_chunk(DOC_ID, 5, CHUNK), 1);
        assert!(fx.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = fixture().await;
        fx.store.fail_next_downloads(2);

        let bytes = fx.fetcher.fetch(&fx.source, 0).await.unwrap();
        assert_eq!(bytes, deterministic_chunk("fetch-seed", 0, FILE_SIZE, CHUNK));
        // Two failed attempts plus the successful one.
        assert_eq!(fx.store.downloads_for_chunk(DOC_ID, 0, CHUNK), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_none_and_clear_registry() {
        let fx = fixture().await;
        fx.store.fail_next_downloads(4);

        assert!(fx.fetcher.fetch(&fx.source, 1).await.is_none());
        assert!(fx.inflight.is_empty());
        assert!(!fx.cache.contains(&fx.source.chunk_key(1)).await);

        // The failure is not sticky: the next fetch succeeds.
        let bytes = fx.fetcher.fetch(&fx.source, 1).await.unwrap();
        assert_eq!(bytes, deterministic_chunk("fetch-seed", 1, FILE_SIZE, CHUNK));
    }

    #[tokio::test]
    async fn test_dropped_claim_unblocks_joiners() {
        let fx = fixture().await;
        let key = fx.source.chunk_key(9);

        let FetchTicket::Claimed(claim) = Arc::clone(&fx.inflight).begin(key.clone()) else {
            panic!("first begin must claim");
        };
        let FetchTicket::Joined(receiver) = Arc::clone(&fx.inflight).begin(key.clone()) else {
            panic!("second begin must join");
        };

        drop(claim);
        assert!(await_outcome(receiver).await.is_none());
        assert!(!fx.inflight.contains(&key));
    }

    #[tokio::test]
    async fn test_successful_fetch_lands_in_cache() {
        let fx = fixture().await;

        fx.fetcher.fetch(&fx.source, 10).await.unwrap();
        // Chunk 10 is the tail: FILE_SIZE % CHUNK bytes.
        let cached = fx.cache.get(&fx.source.chunk_key(10)).await.unwrap();
        assert_eq!(cached.len(), (FILE_SIZE % CHUNK as u64) as usize);
    }
}
