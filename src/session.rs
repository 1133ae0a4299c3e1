//! Session context.
//!
//! One [`SessionContext`] per process wires the credential store, the
//! request interceptor, the auth session, the push channel and the inbox
//! together. Components receive their collaborators here instead of
//! looking them up globally.
//!
//! The auth watcher is the only thing that starts and stops the push
//! channel: it opens the channel and loads the inbox when the session
//! signs in, and closes the channel and empties the inbox when it signs
//! out.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::auth::{AuthSession, AuthState, AuthStatus};
use crate::config::Config;
use crate::credentials::{storage, CredentialStore, TokenStorage};
use crate::events::EventBus;
use crate::http::{ApiClient, HttpTransport};
use crate::notifications::{NotificationStore, DEFAULT_LOAD_LIMIT};
use crate::push::{PushChannel, PushTransport, SignalRTransport};

/// Everything a signed-in client needs, built once.
#[derive(Debug, Clone)]
pub struct SessionContext {
    store: Arc<CredentialStore>,
    status: Arc<AuthStatus>,
    api: ApiClient,
    auth: AuthSession,
    bus: EventBus,
    push: Arc<PushChannel>,
    inbox: NotificationStore,
}

impl SessionContext {
    /// Build a context from configuration, using the configured credential
    /// storage and the SignalR hub.
    pub fn new(config: &Config) -> Result<Self> {
        let storage = storage::storage_for(config)?;
        let transport: Arc<dyn PushTransport> = Arc::new(SignalRTransport::from_config(config)?);
        Self::with_parts(config, storage, transport)
    }

    /// Build a context with explicit storage and push transport.
    pub fn with_parts(
        config: &Config,
        storage: Box<dyn TokenStorage>,
        push_transport: Arc<dyn PushTransport>,
    ) -> Result<Self> {
        let store = Arc::new(CredentialStore::open(storage));
        let status = Arc::new(AuthStatus::for_store(&store));

        let http = Arc::new(HttpTransport::new(
            config.api_base(),
            config.request_timeout(),
            Arc::clone(&store),
        )?);
        let api = ApiClient::new(
            http,
            Arc::clone(&store),
            Arc::clone(&status),
            config.refresh_timeout(),
        );
        let auth = AuthSession::new(api.clone(), Arc::clone(&store), Arc::clone(&status));

        let bus = EventBus::new();
        let push = Arc::new(PushChannel::new(
            push_transport,
            Arc::clone(&store),
            bus.clone(),
            config.backoff_policy(),
        ));

        let inbox = NotificationStore::new(api.clone());
        inbox.attach(&bus);

        Ok(Self {
            store,
            status,
            api,
            auth,
            bus,
            push,
            inbox,
        })
    }

    /// Credential store.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Sign-in state publisher.
    pub fn status(&self) -> &Arc<AuthStatus> {
        &self.status
    }

    /// Authenticated API client.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Login/logout.
    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    /// Push event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Push channel.
    pub fn push(&self) -> &Arc<PushChannel> {
        &self.push
    }

    /// Notification inbox.
    pub fn inbox(&self) -> &NotificationStore {
        &self.inbox
    }

    /// Follow sign-in transitions, starting from the current state.
    pub fn spawn_auth_watcher(&self) -> JoinHandle<()> {
        let mut rx = self.status.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            let mut state = *rx.borrow_and_update();
            loop {
                this.apply(state).await;
                if rx.changed().await.is_err() {
                    break;
                }
                state = *rx.borrow_and_update();
            }
            log::debug!("[Session] Auth watcher stopped");
        })
    }

    /// Close the push channel.
    pub async fn shutdown(&self) {
        self.push.stop_connection().await;
    }

    async fn apply(&self, state: AuthState) {
        match state {
            AuthState::SignedIn => {
                if let Err(e) = self.push.start().await {
                    log::warn!("[Session] Push channel unavailable: {e}");
                }
                if let Err(e) = self.inbox.load(DEFAULT_LOAD_LIMIT).await {
                    log::warn!("[Session] Could not load notifications: {e}");
                }
            }
            AuthState::SignedOut { reason } => {
                log::info!("[Session] Signed out ({reason:?}), closing push channel");
                self.push.stop_connection().await;
                self.inbox.reset();
            }
        }
    }
}
