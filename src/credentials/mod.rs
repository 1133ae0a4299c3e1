//! Credential store.
//!
//! Holds the current bearer token behind a lock and mirrors every change
//! to a [`TokenStorage`] backend so a restart keeps the session. The store
//! has no network logic; it is read by the request interceptor and the push
//! channel and written only by login, logout and the refresh coordinator.
//!
//! Every `clear()` bumps a generation counter. Writers that started from an
//! older session (a refresh racing a logout) commit through
//! [`CredentialStore::set_if_generation`] and lose to the clear.
//!
//! Storage failures are logged and swallowed. A store that cannot be read
//! at startup simply starts signed out.

pub mod storage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use zeroize::{Zeroize, ZeroizeOnDrop};

pub use storage::{FileStorage, KeyringStorage, MemoryStorage, StoredSession, TokenStorage};

/// Opaque bearer token.
///
/// Expiry is not tracked locally; the server reports it with a 401.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building an `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Bearer <token>` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Guarded holder of the current credential.
#[derive(Debug)]
pub struct CredentialStore {
    session: RwLock<StoredSession>,
    generation: AtomicU64,
    storage: Box<dyn TokenStorage>,
}

impl CredentialStore {
    /// Open the store, loading whatever the backend has persisted.
    pub fn open(storage: Box<dyn TokenStorage>) -> Self {
        let session = match storage.load() {
            Ok(Some(session)) => session,
            Ok(None) => StoredSession::default(),
            Err(e) => {
                log::warn!("[Credentials] Could not load stored session, starting signed out: {e:#}");
                StoredSession::default()
            }
        };
        Self {
            session: RwLock::new(session),
            generation: AtomicU64::new(0),
            storage,
        }
    }

    /// A store that keeps nothing beyond the process lifetime.
    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryStorage::default()))
    }

    /// Current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.read(|s| s.access_token.clone().map(Credential))
    }

    /// Replace the current credential.
    pub fn set(&self, credential: Credential) {
        self.update(|s| s.access_token = Some(credential.expose().to_string()));
    }

    /// Replace the current credential unless the store was cleared since
    /// `generation` was read. Returns whether the credential was stored.
    pub fn set_if_generation(&self, credential: Credential, generation: u64) -> bool {
        self.update_if(generation, |s| {
            s.access_token = Some(credential.expose().to_string());
        })
    }

    /// Forget the credential and the session cookies.
    pub fn clear(&self) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        self.reset(&mut session);
    }

    /// Clear unless the store was already cleared since `generation` was
    /// read. Returns whether this call cleared it.
    pub fn clear_if_generation(&self, generation: u64) -> bool {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.reset(&mut session);
        true
    }

    /// Counter bumped by every `clear()`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether a credential is present.
    pub fn is_present(&self) -> bool {
        self.read(|s| s.access_token.is_some())
    }

    /// Raw `Set-Cookie` values captured from earlier auth responses.
    pub fn session_cookies(&self) -> Vec<String> {
        self.read(|s| s.session_cookies.clone())
    }

    /// Merge freshly received `Set-Cookie` values, replacing cookies with
    /// the same name.
    pub fn remember_cookies(&self, cookies: &[String]) {
        if cookies.is_empty() {
            return;
        }
        self.update(|s| {
            for cookie in cookies {
                let name = cookie_name(cookie);
                s.session_cookies.retain(|existing| cookie_name(existing) != name);
                s.session_cookies.push(cookie.clone());
            }
        });
    }

    fn read<T>(&self, f: impl FnOnce(&StoredSession) -> T) -> T {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        f(&session)
    }

    fn update(&self, f: impl FnOnce(&mut StoredSession)) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut session);
        self.persist(&session);
    }

    fn update_if(&self, generation: u64, f: impl FnOnce(&mut StoredSession)) -> bool {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        f(&mut session);
        self.persist(&session);
        true
    }

    // Callers hold the write lock so disk order matches memory order
    fn persist(&self, session: &StoredSession) {
        let result = if session.is_empty() {
            self.storage.delete()
        } else {
            self.storage.save(session)
        };
        if let Err(e) = result {
            log::warn!("[Credentials] Failed to persist session: {e:#}");
        }
    }

    // Generation changes only under the write lock
    fn reset(&self, session: &mut StoredSession) {
        *session = StoredSession::default();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.storage.delete() {
            log::warn!("[Credentials] Failed to delete stored session: {e:#}");
        }
    }
}

/// Cookie name from a `Set-Cookie` value (`name=value; attrs`).
fn cookie_name(set_cookie: &str) -> &str {
    set_cookie
        .split(';')
        .next()
        .and_then(|pair| pair.split('=').next())
        .unwrap_or_default()
        .trim()
}
