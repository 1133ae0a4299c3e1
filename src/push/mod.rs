//! Push channel lifecycle.
//!
//! [`PushChannel`] owns the single connection to the push hub. It is
//! started and stopped from outside (normally by the auth watcher in
//! [`crate::session`]) and recovers from drops on its own.
//!
//! # State machine
//!
//! ```text
//!                 start_connection()
//!   Disconnected ───────────────────► Connecting ──handshake ok──► Connected
//!        ▲                                │                          │   ▲
//!        │         handshake failed       │                     drop │   │ reconnected
//!        ├────────────────────────────────┘                          ▼   │
//!        │                                                       Reconnecting
//!        │   stop_connection() from any state,                      │
//!        └── credential gone, or server forbids reconnecting ───────┘
//! ```
//!
//! A supervisor task owns the live connection. It pumps invocations into
//! the [`EventBus`] and, on a drop, closes the dead connection before
//! dialing a new one, so there is never more than one connection alive.
//! Reconnect attempts run one at a time, spaced by the [`BackoffPolicy`].
//!
//! Failures while reconnecting are never reported to callers; they only
//! show up as `Reconnecting { persistent: true }` once the schedule is
//! exhausted.

pub mod backoff;
pub mod signalr;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::credentials::{Credential, CredentialStore};
use crate::events::EventBus;

pub use backoff::BackoffPolicy;
pub use signalr::{HubOptions, SignalRTransport};
pub use transport::{Disconnect, Invocation, PushConnection, PushTransport};

/// Observable state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Handshake complete; events are flowing.
    Connected,
    /// The connection dropped and is being re-established.
    Reconnecting {
        /// 1-based number of the attempt in progress.
        attempt: u32,
        /// Reconnecting has gone on long enough to show the user.
        persistent: bool,
    },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting {
                attempt,
                persistent: false,
            } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Reconnecting {
                attempt,
                persistent: true,
            } => write!(f, "offline, still retrying (attempt {attempt})"),
        }
    }
}

/// Failure to establish a push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// No credential to connect with.
    NotAuthenticated,
    /// Transport negotiation failed.
    Negotiate(String),
    /// The WebSocket could not be opened or failed mid-handshake.
    Transport(String),
    /// The hub rejected the protocol handshake.
    Handshake(String),
    /// Connecting took longer than the handshake deadline.
    Timeout(Duration),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "Not signed in"),
            Self::Negotiate(msg) => write!(f, "Negotiation failed: {msg}"),
            Self::Transport(msg) => write!(f, "Connection failed: {msg}"),
            Self::Handshake(msg) => write!(f, "Hub handshake failed: {msg}"),
            Self::Timeout(after) => write!(f, "Connection timed out after {}s", after.as_secs()),
        }
    }
}

impl std::error::Error for PushError {}

/// Running supervisor task.
#[derive(Debug)]
struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Cancel the task and wait until it has released its connection.
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::warn!("[Push] Supervisor task ended abnormally: {e}");
        }
    }
}

/// Shared pieces the supervisor task needs.
#[derive(Debug, Clone)]
struct Worker {
    transport: Arc<dyn PushTransport>,
    store: Arc<CredentialStore>,
    bus: EventBus,
    policy: BackoffPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Worker {
    fn set_state(&self, next: ConnectionState) {
        set_state(&self.state, next);
    }

    async fn run(self, initial: Box<dyn PushConnection>, cancel: CancellationToken) {
        let mut next = Some(initial);

        while let Some(mut connection) = next.take() {
            let disconnect = tokio::select! {
                () = cancel.cancelled() => {
                    connection.close().await;
                    return;
                }
                disconnect = pump(connection.as_mut(), &self.bus) => disconnect,
            };

            // Release the dead connection before dialing a new one
            connection.close().await;
            drop(connection);

            if !disconnect.allow_reconnect {
                log::warn!("[Push] {}; not reconnecting", disconnect.reason);
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            log::warn!("[Push] Connection lost: {}", disconnect.reason);
            next = self.reconnect(&cancel).await;
        }
    }

    /// Dial until a connection is up. `None` means stop supervising.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<Box<dyn PushConnection>> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let persistent = self.policy.is_persistent(attempt, started.elapsed());
            self.set_state(ConnectionState::Reconnecting {
                attempt: attempt.saturating_add(1),
                persistent,
            });

            let delay = self.policy.delay(attempt);
            log::debug!("[Push] Reconnect attempt {} in {:?}", attempt + 1, delay);
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            // Token is read at dial time so a refreshed credential is used
            let Some(credential) = self.store.get() else {
                log::info!("[Push] No credential, giving up reconnecting");
                self.set_state(ConnectionState::Disconnected);
                return None;
            };

            let result = tokio::select! {
                () = cancel.cancelled() => return None,
                result = self.transport.connect(&credential) => result,
            };

            match result {
                Ok(connection) => {
                    log::info!("[Push] Reconnected after {} attempt(s)", attempt + 1);
                    self.set_state(ConnectionState::Connected);
                    return Some(connection);
                }
                Err(e) => {
                    log::debug!("[Push] Reconnect attempt {} failed: {}", attempt + 1, e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// Forward invocations to the bus until the connection ends.
async fn pump(connection: &mut dyn PushConnection, bus: &EventBus) -> Disconnect {
    loop {
        match connection.next_event().await {
            Ok(invocation) => {
                bus.dispatch(&invocation.target, &invocation.payload);
            }
            Err(disconnect) => return disconnect,
        }
    }
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            log::debug!("[Push] {} -> {}", current, next);
            *current = next;
            true
        }
    });
}

/// Manager of the single push connection.
#[derive(Debug)]
pub struct PushChannel {
    worker: Worker,
    lifecycle: Mutex<Option<Supervisor>>,
}

impl PushChannel {
    /// Channel that connects through `transport` and publishes on `bus`.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        store: Arc<CredentialStore>,
        bus: EventBus,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            worker: Worker {
                transport,
                store,
                bus,
                policy,
                state: Arc::new(watch::Sender::new(ConnectionState::Disconnected)),
            },
            lifecycle: Mutex::new(None),
        }
    }

    /// Open the channel with `credential`.
    ///
    /// A no-op when already connected. Any previous supervisor is stopped
    /// first. A failed handshake is returned to the caller and is not
    /// retried.
    pub async fn start_connection(&self, credential: &Credential) -> Result<(), PushError> {
        let mut lifecycle = self.lifecycle.lock().await;

        if self.state() == ConnectionState::Connected
            && lifecycle.as_ref().is_some_and(|s| !s.task.is_finished())
        {
            log::debug!("[Push] Already connected");
            return Ok(());
        }

        if let Some(previous) = lifecycle.take() {
            previous.shutdown().await;
        }

        self.worker.set_state(ConnectionState::Connecting);
        match self.worker.transport.connect(credential).await {
            Ok(connection) => {
                self.worker.set_state(ConnectionState::Connected);
                let cancel = CancellationToken::new();
                let task = tokio::spawn(self.worker.clone().run(connection, cancel.clone()));
                *lifecycle = Some(Supervisor { cancel, task });
                log::info!("[Push] Connection established");
                Ok(())
            }
            Err(e) => {
                self.worker.set_state(ConnectionState::Disconnected);
                log::error!("[Push] Failed to connect: {e}");
                Err(e)
            }
        }
    }

    /// Open the channel with the stored credential.
    pub async fn start(&self) -> Result<(), PushError> {
        let credential = self.worker.store.get().ok_or(PushError::NotAuthenticated)?;
        self.start_connection(&credential).await
    }

    /// Close the channel. Idempotent.
    pub async fn stop_connection(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(supervisor) = lifecycle.take() {
            supervisor.shutdown().await;
            log::info!("[Push] Connection stopped");
        }
        self.worker.set_state(ConnectionState::Disconnected);
    }

    /// Whether events are currently flowing.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.worker.state.borrow()
    }

    /// Watch state transitions.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.worker.state.subscribe()
    }

    /// Bus the channel publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.worker.bus
    }
}
