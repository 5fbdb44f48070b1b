//! Capability seam over the remote chunked document store.
//!
//! There is one transport in production, but everything above it depends on
//! the capability set defined here rather than on a concrete client: an
//! authentication exchange yielding a reusable credential blob, a
//! message-to-document resolution call, and a bounded chunk download pinned
//! to a data center. Tests and the demo CLI plug in the deterministic
//! [`simulation`] implementation.

pub mod simulation;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use simulation::{SimulatedDocument, SimulatedStore, deterministic_chunk};

/// Credentials for the authentication exchange.
#[derive(Clone)]
pub struct ApiCredentials {
    /// Application identifier issued by the platform
    pub api_id: i32,
    /// Application hash issued by the platform
    pub api_hash: String,
    /// Bot token used to sign in
    pub bot_token: String,
}

/// Opaque serialized session credential.
///
/// Produced by a successful authentication exchange and replayed by sibling
/// sessions so the expensive exchange runs at most once per process.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBlob {
    /// Serialized session state as exported by the transport
    pub session: String,
}

impl std::fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialBlob({} bytes)", self.session.len())
    }
}

/// Remote handle of a document within the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    /// Document identifier
    pub id: i64,
    /// Access hash paired with the identifier
    pub access_hash: i64,
    /// File reference bytes required by download calls
    pub file_reference: Vec<u8>,
    /// Thumbnail tag; empty for full-size documents
    pub thumb_size: String,
}

/// Resolution output for one document.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    /// Handle used for subsequent downloads
    pub handle: DocumentHandle,
    /// Data center the document is pinned to
    pub dc_id: i32,
    /// Document size in bytes
    pub file_size: u64,
    /// MIME type reported by the store
    pub mime_type: String,
}

/// Errors surfaced by the remote store capability.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The store asked the client to back off for a server-specified wait
    #[error("rate limited by remote store, retry after {retry_after:?}")]
    RateLimited {
        /// Server-specified wait before the call may be re-issued
        retry_after: Duration,
    },

    /// The authentication exchange was rejected
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Reason reported by the store
        reason: String,
    },

    /// The session has no live transport connection
    #[error("session disconnected")]
    Disconnected,

    /// The requested document does not exist or is not accessible
    #[error("document unavailable: {reason}")]
    DocumentUnavailable {
        /// Reason reported by the store
        reason: String,
    },

    /// Any other transport-level failure
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable description of the failure
        reason: String,
    },
}

/// Factory capability: opens authenticated sessions against the store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Performs the full authentication exchange and opens a session.
    ///
    /// This is the expensive path; callers persist the returned blob and use
    /// [`RemoteStore::reuse_credential`] for every subsequent session.
    ///
    /// # Errors
    /// - `RemoteError::RateLimited` - the store demands a wait before retrying
    /// - `RemoteError::AuthFailed` - the credentials were rejected
    /// - `RemoteError::Transport` - the exchange could not be carried out
    async fn authenticate(
        &self,
        credentials: &ApiCredentials,
    ) -> Result<(Box<dyn RemoteSession>, CredentialBlob), RemoteError>;

    /// Opens a session by replaying a previously exported credential.
    ///
    /// The handshake is connect-only and issues no authentication RPC.
    ///
    /// # Errors
    /// - `RemoteError::Transport` - the connection could not be established
    async fn reuse_credential(
        &self,
        blob: &CredentialBlob,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// One authenticated RPC session over a live transport.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Whether the underlying transport connection is currently live.
    fn is_connected(&self) -> bool;

    /// Re-establishes the transport connection in place.
    ///
    /// # Errors
    /// - `RemoteError::Transport` - the connection could not be re-established
    async fn reconnect(&self) -> Result<(), RemoteError>;

    /// Trivial identity lookup used to validate a persisted credential.
    ///
    /// # Errors
    /// - `RemoteError::AuthFailed` - the session credential is stale or corrupt
    /// - `RemoteError::Disconnected` - no live transport connection
    async fn check_liveness(&self) -> Result<(), RemoteError>;

    /// Resolves a message to its document metadata.
    ///
    /// # Errors
    /// - `RemoteError::DocumentUnavailable` - no such message or no document
    /// - `RemoteError::Disconnected` - no live transport connection
    async fn resolve_document(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<DocumentInfo, RemoteError>;

    /// Downloads at most `limit` bytes of a document starting at `offset`.
    ///
    /// The call is pinned to `dc_id`; the session transparently opens the
    /// required data-center connection rather than routing through a home
    /// data center. Implementations must not accumulate more than `limit`
    /// bytes.
    ///
    /// # Errors
    /// - `RemoteError::Disconnected` - no live transport connection
    /// - `RemoteError::DocumentUnavailable` - handle no longer valid
    /// - `RemoteError::Transport` - the download failed
    async fn download_chunk(
        &self,
        handle: &DocumentHandle,
        dc_id: i32,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes, RemoteError>;

    /// Exports the latest credential blob, reflecting any server-side update.
    fn export_credential(&self) -> CredentialBlob;

    /// Closes the transport connection.
    async fn disconnect(&self);
}
