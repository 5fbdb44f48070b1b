//! Millrace - random-access streaming over a remote chunked document store

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! This crate exposes documents held in an authenticated remote object store
//! as byte-addressable loopback HTTP resources with full range-request
//! semantics. The backing store only supports sequential 1 MiB chunk pulls
//! anchored to a data-center id, a document handle, and an offset; the crate
//! hides that behind a session pool, a byte-budgeted chunk cache, a
//! deduplicating fetcher, a background prefetcher, and a range-aware HTTP
//! server, so a media player can probe and seek freely.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod manager;
pub mod prefetch;
pub mod remote;
pub mod server;
pub mod session;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use cache::{ChunkCache, ChunkKey};
pub use config::MillraceConfig;
pub use fetch::{ChunkFetcher, InflightRegistry, StreamSource};
pub use manager::{StreamHandle, StreamManager, StreamPart, StreamRequest};
pub use prefetch::PrefetchEngine;
pub use remote::{RemoteError, RemoteSession, RemoteStore};
pub use tracing_setup::{CliLogLevel, init_tracing};

/// Errors that can bubble up from any Millrace subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MillraceError {
    /// Remote store errors (authentication, resolution, downloads)
    #[error("Remote store error: {0}")]
    Remote(#[from] remote::RemoteError),

    /// Range server errors (binding the loopback socket, response assembly)
    #[error("Server error: {reason}")]
    Server {
        /// Human-readable description of the server failure
        reason: String,
    },

    /// No stream is registered under the requested identifier
    #[error("Stream {stream_id} is not registered")]
    StreamNotFound {
        /// Identifier the caller asked for
        stream_id: String,
    },

    /// A stream with this identifier is already being served
    #[error("Stream {stream_id} is already registered")]
    StreamAlreadyRegistered {
        /// Identifier that collided
        stream_id: String,
    },

    /// Configuration parsing or validation errors
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Human-readable description of the configuration error
        reason: String,
    },

    /// Standard I/O errors from credential persistence or sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using MillraceError as the error type
pub type Result<T> = std::result::Result<T, MillraceError>;
