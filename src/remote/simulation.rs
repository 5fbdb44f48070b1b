//! Deterministic in-process remote store for tests and development.
//!
//! Serves synthetic documents whose chunk contents are derived from a seed,
//! so any byte range can be recomputed independently and compared. Counts
//! authentication exchanges and download RPCs and supports fault injection
//! (rate limits, transient download failures, severed connections), which is
//! what the end-to-end scenarios assert against.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::{
    ApiCredentials, CredentialBlob, DocumentHandle, DocumentInfo, RemoteError, RemoteSession,
    RemoteStore,
};

/// Synthesizes the deterministic content of one chunk.
///
/// Chunk `i` is `sha256(seed || i)` repeated to `chunk_size` bytes; the last
/// chunk of a document is truncated to the remaining length. Offsets at or
/// past `file_size` yield empty bytes.
pub fn deterministic_chunk(seed: &str, chunk_index: u64, file_size: u64, chunk_size: usize) -> Bytes {
    let offset = chunk_index.saturating_mul(chunk_size as u64);
    if offset >= file_size {
        return Bytes::new();
    }
    let len = chunk_size.min((file_size - offset) as usize);

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(chunk_index.to_be_bytes());
    let digest = hasher.finalize();

    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let take = digest.len().min(len - data.len());
        data.extend_from_slice(&digest[..take]);
    }
    Bytes::from(data)
}

/// One synthetic document served by the simulated store.
#[derive(Debug, Clone)]
pub struct SimulatedDocument {
    /// Document identifier
    pub id: i64,
    /// Access hash paired with the identifier
    pub access_hash: i64,
    /// Data center the document is pinned to
    pub dc_id: i32,
    /// Document size in bytes
    pub size: u64,
    /// MIME type reported on resolution
    pub mime_type: String,
    /// Seed for deterministic chunk synthesis
    pub seed: String,
}

impl SimulatedDocument {
    /// Creates a document with a derived access hash on data center 2.
    pub fn new(id: i64, size: u64, mime_type: &str, seed: &str) -> Self {
        Self {
            id,
            access_hash: id.wrapping_mul(0x9e37_79b9),
            dc_id: 2,
            size,
            mime_type: mime_type.to_string(),
            seed: seed.to_string(),
        }
    }
}

struct SessionShared {
    session: String,
    connected: AtomicBool,
}

struct StoreInner {
    documents: Mutex<HashMap<(i64, i32), SimulatedDocument>>,
    valid_sessions: Mutex<HashSet<String>>,
    live_sessions: Mutex<Vec<Weak<SessionShared>>>,
    pending_rate_limits: Mutex<VecDeque<Duration>>,
    download_log: Mutex<HashMap<(i64, u64), u64>>,
    auth_exchanges: AtomicU64,
    failing_downloads: AtomicU64,
    download_delay: Mutex<Duration>,
    session_counter: AtomicU64,
}

impl StoreInner {
    fn documents(&self) -> MutexGuard<'_, HashMap<(i64, i32), SimulatedDocument>> {
        self.documents.lock().expect("documents lock poisoned")
    }

    fn valid_sessions(&self) -> MutexGuard<'_, HashSet<String>> {
        self.valid_sessions.lock().expect("sessions lock poisoned")
    }

    fn download_log(&self) -> MutexGuard<'_, HashMap<(i64, u64), u64>> {
        self.download_log.lock().expect("download log lock poisoned")
    }

    fn rate_limits(&self) -> MutexGuard<'_, VecDeque<Duration>> {
        self.pending_rate_limits
            .lock()
            .expect("rate limit lock poisoned")
    }

    fn delay(&self) -> MutexGuard<'_, Duration> {
        self.download_delay
            .lock()
            .expect("download delay lock poisoned")
    }

    fn live_sessions(&self) -> MutexGuard<'_, Vec<Weak<SessionShared>>> {
        self.live_sessions
            .lock()
            .expect("live sessions lock poisoned")
    }

    fn open_session(inner: &Arc<StoreInner>, session: String) -> SimulatedSession {
        let shared = Arc::new(SessionShared {
            session,
            connected: AtomicBool::new(true),
        });
        inner.live_sessions().push(Arc::downgrade(&shared));
        SimulatedSession {
            store: Arc::clone(inner),
            shared,
        }
    }
}

/// Deterministic [`RemoteStore`] implementation.
pub struct SimulatedStore {
    inner: Arc<StoreInner>,
}

impl SimulatedStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                documents: Mutex::new(HashMap::new()),
                valid_sessions: Mutex::new(HashSet::new()),
                live_sessions: Mutex::new(Vec::new()),
                pending_rate_limits: Mutex::new(VecDeque::new()),
                download_log: Mutex::new(HashMap::new()),
                auth_exchanges: AtomicU64::new(0),
                failing_downloads: AtomicU64::new(0),
                download_delay: Mutex::new(Duration::ZERO),
                session_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a document under `(chat_id, message_id)`.
    pub fn insert_document(&self, chat_id: i64, message_id: i32, document: SimulatedDocument) {
        self.inner.documents().insert((chat_id, message_id), document);
    }

    /// Number of authentication exchanges observed, including rejected ones.
    pub fn auth_exchange_count(&self) -> u64 {
        self.inner.auth_exchanges.load(Ordering::SeqCst)
    }

    /// Total download RPCs observed across all documents.
    pub fn download_rpc_count(&self) -> u64 {
        self.inner.download_log().values().sum()
    }

    /// Download RPCs observed for one chunk of one document.
    pub fn downloads_for_chunk(&self, document_id: i64, chunk_index: u64, chunk_size: usize) -> u64 {
        let offset = chunk_index * chunk_size as u64;
        self.inner
            .download_log()
            .get(&(document_id, offset))
            .copied()
            .unwrap_or(0)
    }

    /// Rejects the next authentication exchange with a rate limit.
    pub fn queue_rate_limit(&self, retry_after: Duration) {
        self.inner.rate_limits().push_back(retry_after);
    }

    /// Fails the next `count` download RPCs with a transport error.
    pub fn fail_next_downloads(&self, count: u64) {
        self.inner.failing_downloads.store(count, Ordering::SeqCst);
    }

    /// Adds artificial latency to every download RPC.
    pub fn set_download_delay(&self, delay: Duration) {
        *self.inner.delay() = delay;
    }

    /// Drops the transport connection of every live session.
    pub fn sever_connections(&self) {
        let mut live = self.inner.live_sessions();
        live.retain(|weak| {
            if let Some(shared) = weak.upgrade() {
                shared.connected.store(false, Ordering::SeqCst);
                true
            } else {
                false
            }
        });
    }
}

impl Default for SimulatedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for SimulatedStore {
    async fn authenticate(
        &self,
        credentials: &ApiCredentials,
    ) -> Result<(Box<dyn RemoteSession>, CredentialBlob), RemoteError> {
        self.inner.auth_exchanges.fetch_add(1, Ordering::SeqCst);

        if credentials.bot_token.is_empty() {
            return Err(RemoteError::AuthFailed {
                reason: "empty bot token".to_string(),
            });
        }

        let pending = self.inner.rate_limits().pop_front();
        if let Some(retry_after) = pending {
            return Err(RemoteError::RateLimited { retry_after });
        }

        let serial = self.inner.session_counter.fetch_add(1, Ordering::SeqCst);
        let session = format!("sim-session-{serial}");
        self.inner.valid_sessions().insert(session.clone());

        let opened = StoreInner::open_session(&self.inner, session.clone());
        Ok((Box::new(opened), CredentialBlob { session }))
    }

    async fn reuse_credential(
        &self,
        blob: &CredentialBlob,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        // Connect-only: replaying a blob never touches the auth counter.
        Ok(Box::new(StoreInner::open_session(
            &self.inner,
            blob.session.clone(),
        )))
    }
}

struct SimulatedSession {
    store: Arc<StoreInner>,
    shared: Arc<SessionShared>,
}

#[async_trait]
impl RemoteSession for SimulatedSession {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), RemoteError> {
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn check_liveness(&self) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        if !self.store.valid_sessions().contains(&self.shared.session) {
            return Err(RemoteError::AuthFailed {
                reason: "unknown session".to_string(),
            });
        }
        Ok(())
    }

    async fn resolve_document(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<DocumentInfo, RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        let documents = self.store.documents();
        let document =
            documents
                .get(&(chat_id, message_id))
                .ok_or_else(|| RemoteError::DocumentUnavailable {
                    reason: format!("no document at chat {chat_id} message {message_id}"),
                })?;
        Ok(DocumentInfo {
            handle: DocumentHandle {
                id: document.id,
                access_hash: document.access_hash,
                file_reference: document.id.to_be_bytes().to_vec(),
                thumb_size: String::new(),
            },
            dc_id: document.dc_id,
            file_size: document.size,
            mime_type: document.mime_type.clone(),
        })
    }

    async fn download_chunk(
        &self,
        handle: &DocumentHandle,
        dc_id: i32,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes, RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }

        let delay = *self.store.delay();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        *self
            .store
            .download_log()
            .entry((handle.id, offset))
            .or_insert(0) += 1;

        let failing = self.store.failing_downloads.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |count| count.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(RemoteError::Transport {
                reason: "injected download failure".to_string(),
            });
        }

        let document = {
            let documents = self.store.documents();
            documents
                .values()
                .find(|doc| doc.id == handle.id && doc.access_hash == handle.access_hash)
                .cloned()
                .ok_or_else(|| RemoteError::DocumentUnavailable {
                    reason: format!("no document with id {}", handle.id),
                })?
        };
        if document.dc_id != dc_id {
            return Err(RemoteError::Transport {
                reason: format!("document lives on dc {}, not dc {dc_id}", document.dc_id),
            });
        }

        debug_assert!(offset % limit as u64 == 0, "unaligned chunk offset");
        let chunk_index = offset / limit as u64;
        Ok(deterministic_chunk(&document.seed, chunk_index, document.size, limit))
    }

    fn export_credential(&self) -> CredentialBlob {
        CredentialBlob {
            session: self.shared.session.clone(),
        }
    }

    async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 1024;

    fn test_credentials() -> ApiCredentials {
        ApiCredentials {
            api_id: 1234,
            api_hash: "hash".to_string(),
            bot_token: "token".to_string(),
        }
    }

    fn store_with_document(size: u64) -> SimulatedStore {
        let store = SimulatedStore::new();
        store.insert_document(10, 20, SimulatedDocument::new(7, size, "video/mp4", "seed"));
        store
    }

    #[test]
    fn test_deterministic_chunk_shapes() {
        let full = deterministic_chunk("s", 0, 2500, CHUNK);
        assert_eq!(full.len(), CHUNK);

        let tail = deterministic_chunk("s", 2, 2500, CHUNK);
        assert_eq!(tail.len(), 2500 - 2 * CHUNK);

        let past_end = deterministic_chunk("s", 3, 2500, CHUNK);
        assert!(past_end.is_empty());

        // Stable across calls, distinct across indices.
        assert_eq!(full, deterministic_chunk("s", 0, 2500, CHUNK));
        assert_ne!(full, deterministic_chunk("s", 1, 2500, CHUNK));
    }

    #[tokio::test]
    async fn test_auth_issues_reusable_credential() {
        let store = store_with_document(5000);
        let (session, blob) = store.authenticate(&test_credentials()).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(store.auth_exchange_count(), 1);

        let sibling = store.reuse_credential(&blob).await.unwrap();
        sibling.check_liveness().await.unwrap();
        assert_eq!(store.auth_exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_liveness_rejects_unknown_session() {
        let store = store_with_document(5000);
        let session = store
            .reuse_credential(&CredentialBlob {
                session: "stale".to_string(),
            })
            .await
            .unwrap();

        let result = session.check_liveness().await;
        assert!(matches!(result, Err(RemoteError::AuthFailed { .. })));
    }

    #[tokio::test]
    async fn test_download_counts_and_content() {
        let store = store_with_document(5000);
        let (session, _) = store.authenticate(&test_credentials()).await.unwrap();
        let info = session.resolve_document(10, 20).await.unwrap();

        let bytes = session
            .download_chunk(&info.handle, info.dc_id, 0, CHUNK)
            .await
            .unwrap();
        assert_eq!(bytes, deterministic_chunk("seed", 0, 5000, CHUNK));
        assert_eq!(store.downloads_for_chunk(7, 0, CHUNK), 1);
        assert_eq!(store.download_rpc_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_counts_as_exchange() {
        let store = store_with_document(5000);
        store.queue_rate_limit(Duration::from_secs(2));

        let result = store.authenticate(&test_credentials()).await;
        assert!(matches!(result, Err(RemoteError::RateLimited { .. })));
        assert_eq!(store.auth_exchange_count(), 1);

        store.authenticate(&test_credentials()).await.unwrap();
        assert_eq!(store.auth_exchange_count(), 2);
    }

    #[tokio::test]
    async fn test_severed_session_reconnects() {
        let store = store_with_document(5000);
        let (session, _) = store.authenticate(&test_credentials()).await.unwrap();

        store.sever_connections();
        assert!(!session.is_connected());
        let info = session.resolve_document(10, 20).await;
        assert!(matches!(info, Err(RemoteError::Disconnected)));

        session.reconnect().await.unwrap();
        assert!(session.is_connected());
    }
}
