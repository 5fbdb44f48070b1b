//! Loopback HTTP range server.
//!
//! One handler serves every registered stream at `/stream/{stream_id}` with
//! HEAD, full GET, and partial GET semantics. Cold seeks trigger a
//! synchronous pre-buffer burst before the first body byte, and the body is
//! emitted chunk by chunk through a bounded channel so the writer's
//! back-pressure reaches the producer.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::cache::ChunkCache;
use crate::config::{ServerConfig, StreamConfig};
use crate::fetch::{ChunkFetcher, StreamSource};
use crate::prefetch::PrefetchEngine;
use crate::{MillraceError, Result};

/// A stream registered with the range server.
pub struct RegisteredStream {
    /// Chunk coordinates handed to the fetcher
    pub source: StreamSource,
    /// Content type served for this stream
    pub mime_type: String,
    /// Prefetch engine owned by this stream
    pub engine: Arc<PrefetchEngine>,
}

struct ServerState {
    streams: RwLock<HashMap<String, Arc<RegisteredStream>>>,
    cache: Arc<ChunkCache>,
    fetcher: Arc<ChunkFetcher>,
    stream_config: StreamConfig,
    server_config: ServerConfig,
}

/// Loopback HTTP server exposing registered streams with range semantics.
pub struct RangeServer {
    state: Arc<ServerState>,
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RangeServer {
    /// Binds `127.0.0.1` on an ephemeral port and starts accepting.
    ///
    /// # Errors
    /// - `MillraceError::Server` - the loopback socket could not be bound
    pub async fn bind(
        cache: Arc<ChunkCache>,
        fetcher: Arc<ChunkFetcher>,
        stream_config: StreamConfig,
        server_config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|error| MillraceError::Server {
                reason: format!("failed to bind loopback listener: {error}"),
            })?;
        let port = listener
            .local_addr()
            .map_err(|error| MillraceError::Server {
                reason: format!("failed to read bound address: {error}"),
            })?
            .port();

        let state = Arc::new(ServerState {
            streams: RwLock::new(HashMap::new()),
            cache,
            fetcher,
            stream_config,
            server_config,
        });
        let router = Router::new()
            .route("/stream/:stream_id", get(get_stream).head(head_stream))
            .with_state(Arc::clone(&state));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, router, shutdown_rx));
        info!(port, "range server listening on loopback");

        Ok(Self {
            state,
            port,
            shutdown,
            accept_task: tokio::sync::Mutex::new(Some(accept_task)),
        })
    }

    /// Port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers a stream under its identifier.
    ///
    /// # Errors
    /// - `MillraceError::StreamAlreadyRegistered` - the identifier is taken
    pub async fn register(&self, stream_id: String, stream: RegisteredStream) -> Result<()> {
        let mut streams = self.state.streams.write().await;
        if streams.contains_key(&stream_id) {
            return Err(MillraceError::StreamAlreadyRegistered { stream_id });
        }
        info!(
            %stream_id,
            size = stream.source.file_size,
            mime = %stream.mime_type,
            "stream registered"
        );
        streams.insert(stream_id, Arc::new(stream));
        Ok(())
    }

    /// Removes a stream registration, returning it when present.
    pub async fn deregister(&self, stream_id: &str) -> Option<Arc<RegisteredStream>> {
        let removed = self.state.streams.write().await.remove(stream_id);
        if removed.is_some() {
            info!(%stream_id, "stream deregistered");
        }
        removed
    }

    /// Whether a stream is registered under this identifier.
    pub async fn is_registered(&self, stream_id: &str) -> bool {
        self.state.streams.read().await.contains_key(stream_id)
    }

    /// Identifiers of every registered stream.
    pub async fn registered_ids(&self) -> Vec<String> {
        self.state.streams.read().await.keys().cloned().collect()
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Accepts connections by hand so every socket gets `TCP_NODELAY`;
/// small-write batching adds latency the player notices on seeks.
async fn accept_loop(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        if let Err(error) = socket.set_nodelay(true) {
            debug!(%error, "could not disable write batching on accepted socket");
        }

        let service = router.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(socket);
            let connection = http1::Builder::new().serve_connection(
                io,
                service_fn(move |request: hyper::Request<Incoming>| {
                    service.clone().oneshot(request)
                }),
            );
            if let Err(error) = connection.await {
                // Players drop connections mid-body all the time.
                debug!(%peer, %error, "connection closed");
            }
        });
    }
    debug!("range server accept loop exited");
}

async fn head_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
) -> Response<Body> {
    let Some(stream) = state.lookup(&stream_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let response = common_headers(Response::builder().status(StatusCode::OK), &stream)
        .header(header::CONTENT_LENGTH, stream.source.file_size.to_string())
        .body(Body::empty());
    match response {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, "failed to assemble HEAD response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_stream(
    State(state): State<Arc<ServerState>>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
) -> Response<Body> {
    let Some(stream) = state.lookup(&stream_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let file_size = stream.source.file_size;

    if file_size == 0 {
        let empty = common_headers(Response::builder().status(StatusCode::OK), &stream)
            .header(header::CONTENT_LENGTH, "0")
            .body(Body::empty());
        return empty.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let (start, end, status) = match parse_range_header(&headers, file_size) {
        Some((start, end)) => (start, end, StatusCode::PARTIAL_CONTENT),
        None => (0, file_size - 1, StatusCode::OK),
    };
    debug!(%stream_id, start, end, status = %status, "serving range");

    // A cache-cold seek gets a synchronous runway before the first byte.
    state.seek_burst(&stream, start).await;

    let body = state.spawn_body(Arc::clone(&stream), start, end);
    let mut builder = common_headers(Response::builder().status(status), &stream)
        .header(header::CONTENT_LENGTH, (end - start + 1).to_string());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{file_size}"),
        );
    }

    match builder.body(body) {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, "failed to assemble range response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn common_headers(
    builder: axum::http::response::Builder,
    stream: &RegisteredStream,
) -> axum::http::response::Builder {
    builder
        .header(header::CONTENT_TYPE, stream.mime_type.as_str())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
}

impl ServerState {
    async fn lookup(&self, stream_id: &str) -> Option<Arc<RegisteredStream>> {
        self.streams.read().await.get(stream_id).cloned()
    }

    /// Fetches the whole pre-buffer window in parallel when the first chunk
    /// of the requested range is not resident, refocusing the prefetch
    /// engine first. Bursts for overlapping ranges coalesce in the in-flight
    /// registry.
    async fn seek_burst(&self, stream: &Arc<RegisteredStream>, start: u64) {
        let chunk_size = self.stream_config.chunk_size as u64;
        let first_chunk = start / chunk_size;
        if self.cache.contains(&stream.source.chunk_key(first_chunk)).await {
            return;
        }

        stream.engine.seek_to(first_chunk);
        let total = stream.source.total_chunks(self.stream_config.chunk_size);
        let burst_end = first_chunk
            .saturating_add(self.stream_config.seek_prebuffer_chunks)
            .min(total);
        debug!(
            stream = %stream.source.stream_id,
            first_chunk,
            burst_end,
            "cold seek, pre-buffering before first byte"
        );

        let fetcher = &self.fetcher;
        let source = &stream.source;
        futures::stream::iter(first_chunk..burst_end)
            .for_each_concurrent(None, |chunk_index| async move {
                let _ = fetcher.fetch(source, chunk_index).await;
            })
            .await;
    }

    fn spawn_body(self: Arc<Self>, stream: Arc<RegisteredStream>, start: u64, end: u64) -> Body {
        let (sender, receiver) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(
            self.server_config.body_channel_depth,
        );
        tokio::spawn(async move {
            self.emit_range(stream, start, end, sender).await;
        });
        Body::from_stream(ReceiverStream::new(receiver))
    }

    /// Walks the byte range chunk by chunk, reporting the playback position
    /// as it goes. The bounded channel provides writer back-pressure: when
    /// the client is not draining, the send suspends this task.
    async fn emit_range(
        &self,
        stream: Arc<RegisteredStream>,
        start: u64,
        end: u64,
        sender: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    ) {
        let chunk_size = self.stream_config.chunk_size as u64;
        let mut byte_pos = start;
        let mut consecutive_failures: u32 = 0;

        while byte_pos <= end {
            // Stop serving promptly once the stream is deregistered.
            if !self
                .streams
                .read()
                .await
                .contains_key(&*stream.source.stream_id)
            {
                debug!(stream = %stream.source.stream_id, "stream gone, closing response");
                return;
            }

            let chunk_index = byte_pos / chunk_size;
            let offset_in_chunk = (byte_pos % chunk_size) as usize;
            stream.engine.notify_playback(chunk_index);

            match self.fetcher.fetch(&stream.source, chunk_index).await {
                Some(chunk) if offset_in_chunk < chunk.len() => {
                    consecutive_failures = 0;
                    let wanted = end - byte_pos + 1;
                    let take = ((chunk.len() - offset_in_chunk) as u64).min(wanted) as usize;
                    let slice = chunk.slice(offset_in_chunk..offset_in_chunk + take);
                    if sender.send(Ok(slice)).await.is_err() {
                        debug!(
                            stream = %stream.source.stream_id,
                            byte_pos,
                            "client disconnected mid-response"
                        );
                        return;
                    }
                    byte_pos += take as u64;
                }
                _ => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.server_config.max_consecutive_failures {
                        // Silent close; the client retries the unserved range.
                        warn!(
                            stream = %stream.source.stream_id,
                            chunk = chunk_index,
                            failures = consecutive_failures,
                            "aborting response after repeated chunk failures"
                        );
                        return;
                    }
                    sleep(self.server_config.stall_retry_delay).await;
                }
            }
        }
    }
}

/// Parses a `Range` header against the stream length.
///
/// Accepts `bytes=S-`, `bytes=S-E`, and suffix `bytes=-N` forms; `E` is
/// clamped to the last byte. Only the first range of a list is honored.
/// Anything unparseable or out of bounds degrades to a full response.
fn parse_range_header(headers: &HeaderMap, file_size: u64) -> Option<(u64, u64)> {
    if file_size == 0 {
        return None;
    }
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let ranges = raw.strip_prefix("bytes=")?;
    let first = ranges.split(',').next()?.trim();
    let (start_str, end_str) = first.split_once('-')?;

    let (start, end) = if start_str.is_empty() {
        // Suffix form: "-N" is the last N bytes.
        let suffix: u64 = end_str.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else if end_str.is_empty() {
        (start_str.parse().ok()?, file_size - 1)
    } else {
        let start = start_str.parse().ok()?;
        let end: u64 = end_str.parse().ok()?;
        (start, end.min(file_size - 1))
    };

    (start <= end && start < file_size).then_some((start, end))
}
