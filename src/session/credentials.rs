//! Persisted session credential storage.
//!
//! One JSON file in the per-user configuration directory holds the latest
//! credential blob. Writes go through a temp file and rename so a crash never
//! leaves a torn credential behind; unreadable or malformed files are treated
//! as absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::remote::CredentialBlob;

/// On-disk form of a persisted session credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCredential {
    /// Opaque session blob as exported by the transport
    pub session: String,
    /// Milliseconds since the Unix epoch at persist time
    pub ts: u64,
}

/// Reads and writes the credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Creates a store backed by an explicit file path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Creates a store at the default per-user location.
    ///
    /// # Errors
    /// Returns an error when no user configuration directory exists on this
    /// platform.
    pub fn default_location() -> io::Result<Self> {
        let base = dirs::config_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no user configuration directory")
        })?;
        Ok(Self::new(base.join("millrace").join("session.json")))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted credential, if a readable one exists.
    pub fn load(&self) -> Option<CredentialBlob> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let parsed: PersistedCredential = serde_json::from_str(&raw).ok()?;
        if parsed.session.is_empty() {
            return None;
        }
        Some(CredentialBlob {
            session: parsed.session,
        })
    }

    /// Atomically persists the latest credential blob.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or the file
    /// cannot be written.
    pub fn persist(&self, blob: &CredentialBlob) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            create_dir_private(parent)?;
        }

        let record = PersistedCredential {
            session: blob.session.clone(),
            ts: unix_millis(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        restrict_permissions(&staging)?;
        fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), "credential persisted");
        Ok(())
    }

    /// Removes the persisted credential, ignoring a missing file.
    pub fn discard(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn create_dir_private(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_dir_private(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
