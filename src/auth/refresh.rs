//! Single-flight token refresh.
//!
//! When several requests fail with 401 at once, exactly one refresh call
//! goes out. The first failing request installs an in-flight handle and
//! spawns the refresh task; every later failure attaches to that handle and
//! receives the same outcome.
//!
//! # Protocol
//!
//! ```text
//!   recover() ──lock──► slot empty? ──yes──► stored credential newer? ──yes──► return it
//!                          │                          │ no
//!                          │ no                       ▼
//!                          │                 install handle, spawn refresh task
//!                          ▼                          │
//!                     clone handle ◄──────────────────┘
//!                          │
//!                          ▼
//!                  await published outcome
//! ```
//!
//! The handle is installed under a synchronous mutex before anything is
//! awaited, so there is no window between "is a refresh running?" and
//! "a refresh is running". The refresh runs in its own task: a caller that
//! gives up waiting does not cancel the refresh for everyone else.
//!
//! The task stores the outcome in the credential store, then clears the
//! slot, then publishes. A 401 that arrives after the slot is cleared sees
//! the new credential and is replayed without another refresh. If the slot
//! is empty and the store holds nothing while the request did carry a
//! credential, the session already ended and the 401 fails without a
//! refresh.
//!
//! Each episode captures the store's generation when it starts. Its result
//! is committed only if no `clear()` happened in between, so a logout during
//! a refresh stays a logout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{AuthStatus, SignOutReason};
use crate::credentials::{Credential, CredentialStore};

/// Outcome shared by every waiter of one refresh episode.
pub type RefreshOutcome = Result<Credential, RefreshError>;

/// Why a refresh episode failed. Always fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The refresh endpoint answered with a non-success status.
    Rejected {
        /// HTTP status returned by the refresh endpoint.
        status: u16,
    },
    /// The refresh call did not finish within the configured timeout.
    Timeout(Duration),
    /// The refresh call failed at the network level.
    Network(String),
    /// The refresh endpoint answered 2xx with an unusable body.
    Malformed(String),
    /// The refresh task went away without publishing an outcome.
    Aborted,
    /// The session was torn down before or during the refresh.
    SessionEnded,
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { status } => write!(f, "Refresh rejected with status {status}"),
            Self::Timeout(after) => write!(f, "Refresh timed out after {}s", after.as_secs()),
            Self::Network(msg) => write!(f, "Refresh failed: {msg}"),
            Self::Malformed(msg) => write!(f, "Malformed refresh response: {msg}"),
            Self::Aborted => write!(f, "Refresh aborted"),
            Self::SessionEnded => write!(f, "Session already ended"),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Performs the actual refresh network call.
#[async_trait]
pub trait TokenRefresher: Send + Sync + std::fmt::Debug {
    /// Exchange the session cookie for a new bearer token.
    async fn refresh(&self) -> RefreshOutcome;
}

type InFlight = watch::Receiver<Option<RefreshOutcome>>;

/// Serializes recovery from authorization failures.
#[derive(Debug, Clone)]
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    status: Arc<AuthStatus>,
    refresher: Arc<dyn TokenRefresher>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    timeout: Duration,
}

impl RefreshCoordinator {
    /// Create a coordinator that refreshes through `refresher`, bounded by
    /// `timeout`.
    pub fn new(
        store: Arc<CredentialStore>,
        status: Arc<AuthStatus>,
        refresher: Arc<dyn TokenRefresher>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            status,
            refresher,
            in_flight: Arc::new(Mutex::new(None)),
            timeout,
        }
    }

    /// Whether a refresh episode is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Recover from a 401 received by a request that carried `stale`.
    ///
    /// Joins the running refresh episode or starts one. Returns the
    /// credential to replay with, or the episode's failure (in which case
    /// the session has already been signed out).
    pub async fn recover(&self, stale: Option<&Credential>) -> RefreshOutcome {
        let mut outcome_rx = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(rx) = slot.as_ref() {
                log::debug!("[Refresh] Joining refresh already in flight");
                rx.clone()
            } else {
                match self.store.get() {
                    Some(current) if stale != Some(&current) => {
                        log::debug!("[Refresh] Credential already renewed, replaying without refresh");
                        return Ok(current);
                    }
                    None if stale.is_some() => {
                        log::debug!("[Refresh] Session already ended, not refreshing");
                        return Err(RefreshError::SessionEnded);
                    }
                    _ => {}
                }
                let rx = self.start_episode();
                *slot = Some(rx.clone());
                rx
            }
        };

        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(published) => published.clone().unwrap_or(Err(RefreshError::Aborted)),
            Err(_) => Err(RefreshError::Aborted),
        };
        outcome
    }

    /// Spawn the refresh task. Called with the slot lock held.
    fn start_episode(&self) -> InFlight {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let this = self.clone();
        let generation = self.store.generation();

        log::info!("[Refresh] Access token rejected, refreshing");
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(this.timeout, this.refresher.refresh()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RefreshError::Timeout(this.timeout)),
            };

            let outcome = match outcome {
                Ok(credential) => {
                    if this.store.set_if_generation(credential.clone(), generation) {
                        this.status.signed_in();
                        log::info!("[Refresh] Access token refreshed");
                        Ok(credential)
                    } else {
                        log::info!("[Refresh] Session ended during refresh, discarding new token");
                        Err(RefreshError::SessionEnded)
                    }
                }
                Err(e) => {
                    if this.store.clear_if_generation(generation) {
                        log::warn!("[Refresh] {e}; signing out");
                        this.status.signed_out(SignOutReason::SessionExpired);
                    } else {
                        log::debug!("[Refresh] {e}; session already ended");
                    }
                    Err(e)
                }
            };

            this.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            // Receivers may all be gone; the store already has the outcome.
            let _ = outcome_tx.send(Some(outcome));
        });

        outcome_rx
    }
}
