//! Durable storage backends for the session record.
//!
//! The session record (access token plus captured session cookies) is
//! stored as one JSON document so a single keychain prompt covers it.
//!
//! # Backends
//!
//! - [`KeyringStorage`]: OS keyring entry `acord-session/session`
//! - [`FileStorage`]: `{config_dir}/credentials.json`, mode 0600
//! - [`MemoryStorage`]: process memory, for tests and `token_storage = "memory"`
//!
//! Backends report errors; the credential store decides to swallow them.

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::{Config, TokenStorageKind};

/// Keyring service name.
const KEYRING_SERVICE: &str = "acord-session";
/// Keyring entry holding the session record.
const KEYRING_ENTRY: &str = "session";

/// Everything persisted between runs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Current bearer token, if signed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Raw `Set-Cookie` values captured from `/auth/*` responses. The
    /// refresh cookie must outlive the process for refresh to work after
    /// a restart.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_cookies: Vec<String>,

    /// Schema version for future migrations.
    #[serde(default = "default_version")]
    pub version: u8,
}

fn default_version() -> u8 {
    1
}

impl std::fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSession")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("session_cookies", &self.session_cookies.len())
            .field("version", &self.version)
            .finish()
    }
}

impl StoredSession {
    /// True when nothing worth persisting is left.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.session_cookies.is_empty()
    }
}

/// A place the session record can be loaded from and saved to.
pub trait TokenStorage: Send + Sync + std::fmt::Debug {
    /// Load the stored record. `Ok(None)` means nothing was stored.
    fn load(&self) -> Result<Option<StoredSession>>;

    /// Replace the stored record.
    fn save(&self, session: &StoredSession) -> Result<()>;

    /// Remove the stored record. Removing a missing record is not an error.
    fn delete(&self) -> Result<()>;
}

/// Build the backend selected in the configuration.
pub fn storage_for(config: &Config) -> Result<Box<dyn TokenStorage>> {
    Ok(match config.token_storage {
        TokenStorageKind::Keyring => Box::new(KeyringStorage::new()),
        TokenStorageKind::File => {
            let path = Config::config_dir()?.join("credentials.json");
            Box::new(FileStorage::new(path))
        }
        TokenStorageKind::Memory => Box::new(MemoryStorage::default()),
    })
}

/// OS keyring backend.
#[derive(Debug, Default)]
pub struct KeyringStorage;

impl KeyringStorage {
    /// Create a keyring backend using the default service and entry names.
    pub fn new() -> Self {
        Self
    }

    fn entry() -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, KEYRING_ENTRY).context("Failed to open keyring entry")
    }
}

impl TokenStorage for KeyringStorage {
    fn load(&self) -> Result<Option<StoredSession>> {
        match Self::entry()?.get_password() {
            Ok(json) => {
                let session = serde_json::from_str(&json).context("Keyring session data corrupted")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Keyring read failed: {e}")),
        }
    }

    fn save(&self, session: &StoredSession) -> Result<()> {
        let json = serde_json::to_string(session)?;
        Self::entry()?
            .set_password(&json)
            .map_err(|e| anyhow::anyhow!("Keyring write failed: {e}"))
    }

    fn delete(&self) -> Result<()> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Keyring delete failed: {e}")),
        }
    }
}

/// JSON file backend.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Store the session record at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStorage for FileStorage {
    fn load(&self) -> Result<Option<StoredSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let session = serde_json::from_str(&content)
            .with_context(|| format!("Corrupted session file {}", self.path.display()))?;
        Ok(Some(session))
    }

    fn save(&self, session: &StoredSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(session)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // New files are owner-only from the first byte
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        // `mode` does not apply to a file that already exists
        #[cfg(unix)]
        file.set_permissions(fs::Permissions::from_mode(0o600))?;

        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    session: Mutex<Option<StoredSession>>,
}

impl MemoryStorage {
    /// Start with an existing record, as if it had been persisted earlier.
    pub fn with_session(session: StoredSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl TokenStorage for MemoryStorage {
    fn load(&self) -> Result<Option<StoredSession>> {
        let guard = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, session: &StoredSession) -> Result<()> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}
