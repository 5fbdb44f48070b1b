//! Stream orchestration: the public start/stop/shutdown surface.
//!
//! The manager is the single root handle owning the shared cache, in-flight
//! registry, session pool, fetcher, and range server. Components receive
//! explicit `Arc` handles from here; there are no module-level singletons.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::ChunkCache;
use crate::config::MillraceConfig;
use crate::fetch::{ChunkFetcher, InflightRegistry, StreamSource};
use crate::prefetch::PrefetchEngine;
use crate::remote::{ApiCredentials, RemoteStore};
use crate::server::{RangeServer, RegisteredStream};
use crate::session::{CredentialStore, SessionPool};
use crate::{MillraceError, Result};

/// Everything needed to expose one remote document as a local stream.
#[derive(Clone)]
pub struct StreamRequest {
    /// Identifier the stream is served under (`/stream/{stream_id}`)
    pub stream_id: String,
    /// Chat containing the document message
    pub chat_id: i64,
    /// Message carrying the document
    pub message_id: i32,
    /// Application identifier for the authentication exchange
    pub api_id: i32,
    /// Application hash for the authentication exchange
    pub api_hash: String,
    /// Bot token used to sign in
    pub bot_token: String,
    /// Overrides the resolved MIME type when set
    pub mime_type: Option<String>,
    /// Overrides the resolved size when set
    pub total_size: Option<u64>,
    /// Multi-part uploads; the first part's message is the one resolved
    pub parts: Vec<StreamPart>,
}

/// One part of a multi-part upload.
#[derive(Clone)]
pub struct StreamPart {
    /// Message carrying this part
    pub message_id: i32,
}

/// Where a started stream can be played from.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    /// Full playback URL on the loopback interface
    pub url: String,
    /// Bound server port
    pub port: u16,
}

/// Root handle composing the session pool, cache, fetcher, prefetcher, and
/// range server into the public streaming surface.
pub struct StreamManager {
    config: MillraceConfig,
    pool: Arc<SessionPool>,
    cache: Arc<ChunkCache>,
    inflight: Arc<InflightRegistry>,
    fetcher: Arc<ChunkFetcher>,
    server: Mutex<Option<Arc<RangeServer>>>,
}

impl StreamManager {
    /// Creates a manager around the given remote store capability.
    ///
    /// # Errors
    /// - `MillraceError::Io` - no usable credential file location exists
    pub fn new(store: Arc<dyn RemoteStore>, config: MillraceConfig) -> Result<Self> {
        let credentials = match &config.pool.credential_path {
            Some(path) => CredentialStore::new(path.clone()),
            None => CredentialStore::default_location()?,
        };
        let pool = Arc::new(SessionPool::new(store, credentials, config.pool.clone()));
        let cache = Arc::new(ChunkCache::new(config.cache.max_bytes));
        let inflight = Arc::new(InflightRegistry::new());
        let fetcher = Arc::new(ChunkFetcher::new(
            Arc::clone(&pool),
            Arc::clone(&cache),
            Arc::clone(&inflight),
            config.stream.chunk_size,
            config.fetch.clone(),
        ));

        Ok(Self {
            config,
            pool,
            cache,
            inflight,
            fetcher,
            server: Mutex::new(None),
        })
    }

    /// Shared chunk cache, exposed for observation.
    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Resolves a document and exposes it at a loopback playback URL.
    ///
    /// Ensures the session pool and range server exist, resolves the remote
    /// handle, warms up the head and tail of the file, starts the prefetch
    /// engine, and registers the stream.
    ///
    /// # Errors
    /// - `MillraceError::Remote` - authentication or resolution failed
    /// - `MillraceError::Server` - the loopback socket could not be bound
    /// - `MillraceError::StreamAlreadyRegistered` - identifier already in use
    pub async fn start_stream(&self, request: StreamRequest) -> Result<StreamHandle> {
        let api = ApiCredentials {
            api_id: request.api_id,
            api_hash: request.api_hash.clone(),
            bot_token: request.bot_token.clone(),
        };
        self.pool.ensure_pool(&api, self.config.pool.size).await?;

        let server = self.ensure_server().await?;
        if server.is_registered(&request.stream_id).await {
            return Err(MillraceError::StreamAlreadyRegistered {
                stream_id: request.stream_id,
            });
        }

        let message_id = request
            .parts
            .first()
            .map(|part| part.message_id)
            .unwrap_or(request.message_id);
        let session = self.pool.any_connected().await?;
        let mut document = session.resolve_document(request.chat_id, message_id).await?;
        if let Some(mime_type) = &request.mime_type {
            document.mime_type = mime_type.clone();
        }
        if let Some(total_size) = request.total_size {
            document.file_size = total_size;
        }
        if document.mime_type.is_empty() {
            document.mime_type = "application/octet-stream".to_string();
        }

        let source = StreamSource::new(
            request.stream_id.as_str(),
            document.handle,
            document.dc_id,
            document.file_size,
        );
        let total_chunks = source.total_chunks(self.config.stream.chunk_size);
        self.warm_up(&source, total_chunks).await;

        let engine = Arc::new(PrefetchEngine::new(
            source.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.cache),
            Arc::clone(&self.inflight),
            &self.config.stream,
        ));
        engine
            .start(self.config.stream.prefetch_chunks.min(total_chunks))
            .await;

        let registered = RegisteredStream {
            source,
            mime_type: document.mime_type,
            engine: Arc::clone(&engine),
        };
        if let Err(error) = server.register(request.stream_id.clone(), registered).await {
            engine.stop().await;
            return Err(error);
        }

        let url = format!(
            "http://127.0.0.1:{}/stream/{}",
            server.port(),
            request.stream_id
        );
        info!(
            stream_id = %request.stream_id,
            %url,
            size = document.file_size,
            "stream started"
        );
        Ok(StreamHandle {
            url,
            port: server.port(),
        })
    }

    /// Stops a stream: terminates its workers, removes the registration, and
    /// purges its cached chunks.
    ///
    /// # Errors
    /// - `MillraceError::StreamNotFound` - no stream under this identifier
    pub async fn stop_stream(&self, stream_id: &str) -> Result<()> {
        let server = self.server.lock().await.clone();
        let stream = match server {
            Some(server) => server.deregister(stream_id).await,
            None => None,
        }
        .ok_or_else(|| MillraceError::StreamNotFound {
            stream_id: stream_id.to_string(),
        })?;

        stream.engine.stop().await;
        self.cache.delete_prefix(stream_id).await;
        info!(%stream_id, "stream stopped");
        Ok(())
    }

    /// Stops all streams, clears the cache, closes the server, and
    /// disconnects every session.
    ///
    /// # Errors
    /// Currently infallible; the signature leaves room for teardown errors.
    pub async fn shutdown(&self) -> Result<()> {
        let server = self.server.lock().await.take();
        if let Some(server) = server {
            for stream_id in server.registered_ids().await {
                if let Some(stream) = server.deregister(&stream_id).await {
                    stream.engine.stop().await;
                }
            }
            server.shutdown().await;
        }
        self.cache.clear().await;
        self.pool.disconnect_all().await;
        info!("millrace shut down");
        Ok(())
    }

    async fn ensure_server(&self) -> Result<Arc<RangeServer>> {
        let mut slot = self.server.lock().await;
        if let Some(server) = slot.as_ref() {
            return Ok(Arc::clone(server));
        }
        let server = Arc::new(
            RangeServer::bind(
                Arc::clone(&self.cache),
                Arc::clone(&self.fetcher),
                self.config.stream.clone(),
                self.config.server.clone(),
            )
            .await?,
        );
        *slot = Some(Arc::clone(&server));
        Ok(server)
    }

    /// Fetches the head and tail of the file in parallel before playback.
    /// The tail matters because some container formats keep their index at
    /// end of file; serving it from cache avoids an immediate giant seek.
    async fn warm_up(&self, source: &StreamSource, total_chunks: u64) {
        let head_end = self.config.stream.prefetch_chunks.min(total_chunks);
        let tail_start = total_chunks
            .saturating_sub(self.config.stream.tail_chunks)
            .max(head_end);
        let indices: Vec<u64> = (0..head_end).chain(tail_start..total_chunks).collect();
        debug!(
            stream = %source.stream_id,
            head = head_end,
            tail = total_chunks - tail_start,
            "warming up head and tail"
        );

        futures::stream::iter(indices)
            .for_each_concurrent(self.config.stream.parallel_workers, |chunk_index| {
                async move {
                    let _ = self.fetcher.fetch(source, chunk_index).await;
                }
            })
            .await;
    }
}
