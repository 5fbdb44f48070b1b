//! Pool of authenticated transport sessions.
//!
//! Sustaining streaming throughput needs several parallel connections, but
//! the authentication exchange is expensive and rate-limited, so it runs at
//! most once per process: session 0 authenticates (or replays a persisted
//! credential), and every sibling connects by replaying the resulting blob.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::credentials::CredentialStore;
use crate::config::PoolConfig;
use crate::remote::{
    ApiCredentials, CredentialBlob, DocumentInfo, DocumentHandle, RemoteError, RemoteSession,
    RemoteStore,
};

/// One pool slot: a remote session plus its reconnect guard.
pub struct PooledSession {
    session: Box<dyn RemoteSession>,
    reconnect_guard: Mutex<()>,
    slot: usize,
}

impl PooledSession {
    fn new(slot: usize, session: Box<dyn RemoteSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            reconnect_guard: Mutex::new(()),
            slot,
        })
    }

    /// Whether the underlying transport connection is live.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Reconnects in place when the transport dropped; no-op when live.
    ///
    /// # Errors
    /// - `RemoteError::Transport` - the connection could not be re-established
    pub async fn ensure_connected(&self) -> Result<(), RemoteError> {
        if self.session.is_connected() {
            return Ok(());
        }
        let _guard = self.reconnect_guard.lock().await;
        if self.session.is_connected() {
            return Ok(());
        }
        debug!(slot = self.slot, "reconnecting pooled session");
        self.session.reconnect().await
    }

    /// Resolves a message to its document metadata.
    ///
    /// # Errors
    /// - `RemoteError::DocumentUnavailable` - no such message or no document
    /// - `RemoteError::Disconnected` - no live transport connection
    pub async fn resolve_document(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<DocumentInfo, RemoteError> {
        self.session.resolve_document(chat_id, message_id).await
    }

    /// Downloads at most `limit` bytes of a document starting at `offset`.
    ///
    /// # Errors
    /// - `RemoteError::Disconnected` - no live transport connection
    /// - `RemoteError::DocumentUnavailable` - handle no longer valid
    /// - `RemoteError::Transport` - the download failed
    pub async fn download_chunk(
        &self,
        handle: &DocumentHandle,
        dc_id: i32,
        offset: u64,
        limit: usize,
    ) -> Result<bytes::Bytes, RemoteError> {
        self.session.download_chunk(handle, dc_id, offset, limit).await
    }

    async fn disconnect(&self) {
        self.session.disconnect().await;
    }
}

/// Fixed-size pool of authenticated sessions shared by all streams.
pub struct SessionPool {
    store: Arc<dyn RemoteStore>,
    credentials: CredentialStore,
    config: PoolConfig,
    sessions: RwLock<Vec<Arc<PooledSession>>>,
    grow_guard: Mutex<()>,
    active_credential: Mutex<Option<CredentialBlob>>,
}

impl SessionPool {
    /// Creates an empty pool over the given store capability.
    pub fn new(store: Arc<dyn RemoteStore>, credentials: CredentialStore, config: PoolConfig) -> Self {
        Self {
            store,
            credentials,
            config,
            sessions: RwLock::new(Vec::new()),
            grow_guard: Mutex::new(()),
            active_credential: Mutex::new(None),
        }
    }

    /// Raises the pool to `desired_size` live sessions. Idempotent.
    ///
    /// Authenticates at most once per process lifetime across all calls: a
    /// persisted credential is reused when it passes a liveness probe, and
    /// siblings always connect by replaying the working blob. Rate limits
    /// from the store are absorbed by honoring the server-specified wait.
    ///
    /// # Errors
    /// - `RemoteError::AuthFailed` - the authentication exchange was rejected
    /// - `RemoteError::Transport` - a sibling connection could not be opened
    pub async fn ensure_pool(
        &self,
        api: &ApiCredentials,
        desired_size: usize,
    ) -> Result<(), RemoteError> {
        let _guard = self.grow_guard.lock().await;
        if self.sessions.read().await.len() >= desired_size {
            return Ok(());
        }

        let (blob, first_session) = self.working_credential(api).await?;

        let mut opened: Vec<Box<dyn RemoteSession>> = Vec::new();
        if self.sessions.read().await.is_empty() {
            if let Some(session) = first_session {
                opened.push(session);
            }
        }

        let current = self.sessions.read().await.len();
        while current + opened.len() < desired_size {
            let session = self.connect_sibling(&blob).await?;
            // A connect may hand back a refreshed credential; keep the
            // persisted copy current.
            let exported = session.export_credential();
            if exported != blob {
                self.remember_credential(&exported).await;
            }
            opened.push(session);
        }

        let mut sessions = self.sessions.write().await;
        for session in opened {
            let slot = sessions.len();
            sessions.push(PooledSession::new(slot, session));
        }
        info!(size = sessions.len(), "session pool ready");
        Ok(())
    }

    /// Routes `chunk_index % pool_size` and returns a connected session.
    ///
    /// # Errors
    /// - `RemoteError::Disconnected` - the pool is empty
    /// - `RemoteError::Transport` - the selected session could not reconnect
    pub async fn acquire(&self, chunk_index: u64) -> Result<Arc<PooledSession>, RemoteError> {
        let session = {
            let sessions = self.sessions.read().await;
            if sessions.is_empty() {
                return Err(RemoteError::Disconnected);
            }
            let slot = (chunk_index % sessions.len() as u64) as usize;
            Arc::clone(&sessions[slot])
        };
        session.ensure_connected().await?;
        Ok(session)
    }

    /// Returns the first connected session, reconnecting one if necessary.
    ///
    /// # Errors
    /// - `RemoteError::Disconnected` - the pool is empty
    /// - `RemoteError::Transport` - no session could be (re)connected
    pub async fn any_connected(&self) -> Result<Arc<PooledSession>, RemoteError> {
        let sessions: Vec<Arc<PooledSession>> = self.sessions.read().await.clone();
        if let Some(session) = sessions.iter().find(|session| session.is_connected()) {
            return Ok(Arc::clone(session));
        }
        let first = sessions.first().ok_or(RemoteError::Disconnected)?;
        first.ensure_connected().await?;
        Ok(Arc::clone(first))
    }

    /// Number of sessions currently held.
    pub async fn size(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Disconnects and drops every session.
    pub async fn disconnect_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for session in sessions {
            session.disconnect().await;
        }
    }

    /// Produces a credential blob known to work, authenticating at most once.
    ///
    /// Returns the session that validated the blob when one was opened along
    /// the way, so `ensure_pool` can seed slot 0 without a second connect.
    async fn working_credential(
        &self,
        api: &ApiCredentials,
    ) -> Result<(CredentialBlob, Option<Box<dyn RemoteSession>>), RemoteError> {
        if let Some(blob) = self.active_credential.lock().await.clone() {
            return Ok((blob, None));
        }

        if let Some(blob) = self.credentials.load() {
            match self.store.reuse_credential(&blob).await {
                Ok(session) => match session.check_liveness().await {
                    Ok(()) => {
                        info!("reusing persisted session credential");
                        *self.active_credential.lock().await = Some(blob.clone());
                        return Ok((blob, Some(session)));
                    }
                    Err(error) => {
                        warn!(%error, "persisted credential failed liveness probe, discarding");
                        session.disconnect().await;
                        self.credentials.discard();
                    }
                },
                Err(error) => {
                    warn!(%error, "persisted credential could not connect, discarding");
                    self.credentials.discard();
                }
            }
        }

        loop {
            match self.store.authenticate(api).await {
                Ok((session, blob)) => {
                    info!("authentication exchange complete");
                    self.remember_credential(&blob).await;
                    return Ok((blob, Some(session)));
                }
                Err(RemoteError::RateLimited { retry_after }) => {
                    self.honor_rate_limit(retry_after).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn connect_sibling(
        &self,
        blob: &CredentialBlob,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        loop {
            match self.store.reuse_credential(blob).await {
                Ok(session) => return Ok(session),
                Err(RemoteError::RateLimited { retry_after }) => {
                    self.honor_rate_limit(retry_after).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn remember_credential(&self, blob: &CredentialBlob) {
        *self.active_credential.lock().await = Some(blob.clone());
        if let Err(error) = self.credentials.persist(blob) {
            warn!(%error, "failed to persist session credential");
        }
    }

    /// Sleeps out a server-specified rate limit, logging a coarse countdown.
    /// Never retried with exponential backoff; the wait is the server's.
    async fn honor_rate_limit(&self, retry_after: Duration) {
        let total = retry_after + self.config.rate_limit_margin;
        warn!(
            wait_secs = total.as_secs_f64(),
            "remote store rate limit, honoring server wait"
        );
        let interval = self.config.rate_limit_log_interval;
        let mut remaining = total;
        while remaining > interval {
            sleep(interval).await;
            remaining -= interval;
            info!(
                remaining_secs = remaining.as_secs_f64(),
                "rate limit wait continuing"
            );
        }
        sleep(remaining).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::MillraceConfig;
    use crate::remote::{SimulatedDocument, SimulatedStore};

    fn test_api() -> ApiCredentials {
        ApiCredentials {
            api_id: 1234,
            api_hash: "hash".to_string(),
            bot_token: "token".to_string(),
        }
    }

    fn pool_over(store: &Arc<SimulatedStore>, dir: &tempfile::TempDir) -> SessionPool {
        let credentials = CredentialStore::new(dir.path().join("session.json"));
        SessionPool::new(
            Arc::clone(store) as Arc<dyn RemoteStore>,
            credentials,
            MillraceConfig::for_testing().pool,
        )
    }

    fn seeded_store() -> Arc<SimulatedStore> {
        let store = SimulatedStore::new();
        store.insert_document(1, 1, SimulatedDocument::new(9, 4096, "video/mp4", "s"));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_ensure_pool_authenticates_once() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_over(&store, &dir);

        pool.ensure_pool(&test_api(), 3).await.unwrap();
        assert_eq!(pool.size().await, 3);
        assert_eq!(store.auth_exchange_count(), 1);

        // Idempotent, and growing further still reuses the blob.
        pool.ensure_pool(&test_api(), 3).await.unwrap();
        pool.ensure_pool(&test_api(), 5).await.unwrap();
        assert_eq!(pool.size().await, 5);
        assert_eq!(store.auth_exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_persisted_credential_skips_authentication() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();

        let first = pool_over(&store, &dir);
        first.ensure_pool(&test_api(), 2).await.unwrap();
        assert_eq!(store.auth_exchange_count(), 1);
        first.disconnect_all().await;

        // A fresh pool in the same "process tree" finds the blob on disk.
        let second = pool_over(&store, &dir);
        second.ensure_pool(&test_api(), 2).await.unwrap();
        assert_eq!(store.auth_exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_credential_is_discarded_and_reauthenticated() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::new(dir.path().join("session.json"));
        credentials
            .persist(&CredentialBlob {
                session: "stale-blob".to_string(),
            })
            .unwrap();

        let pool = pool_over(&store, &dir);
        pool.ensure_pool(&test_api(), 2).await.unwrap();

        assert_eq!(store.auth_exchange_count(), 1);
        // The file now holds the fresh blob, not the stale one.
        let reloaded = credentials.load().unwrap();
        assert_ne!(reloaded.session, "stale-blob");
    }

    #[tokio::test]
    async fn test_rate_limit_is_honored_then_succeeds() {
        let store = seeded_store();
        store.queue_rate_limit(Duration::from_millis(120));
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_over(&store, &dir);

        let started = Instant::now();
        pool.ensure_pool(&test_api(), 2).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(120));
        // One rejected exchange plus one accepted; siblings add none.
        assert_eq!(store.auth_exchange_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_reconnects_in_place() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_over(&store, &dir);
        pool.ensure_pool(&test_api(), 3).await.unwrap();

        store.sever_connections();
        let session = pool.acquire(7).await.unwrap();
        assert!(session.is_connected());

        let any = pool.any_connected().await.unwrap();
        assert!(any.is_connected());
    }

    #[tokio::test]
    async fn test_acquire_on_empty_pool_fails() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_over(&store, &dir);

        assert!(matches!(
            pool.acquire(0).await,
            Err(RemoteError::Disconnected)
        ));
    }
}
