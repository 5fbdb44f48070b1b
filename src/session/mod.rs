//! Authenticated session management.
//!
//! The pool holds a fixed set of live transport sessions and amortizes the
//! expensive authentication exchange: only the first session ever
//! authenticates from scratch, and the resulting credential blob is persisted
//! and replayed into every sibling.

pub mod credentials;
pub mod pool;

pub use credentials::{CredentialStore, PersistedCredential};
pub use pool::{PooledSession, SessionPool};
