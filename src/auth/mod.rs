//! Sign-in state, login/logout and token refresh.
//!
//! [`AuthStatus`] is the single source of truth for "is the user signed
//! in". It is a `watch` channel, so the push channel watcher and the CLI
//! can react to transitions without polling. Only real transitions are
//! published; a refresh that keeps the session signed in is silent.
//!
//! [`AuthSession`] performs the login and logout operations. The refresh
//! protocol lives in [`refresh`].

pub mod refresh;

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::credentials::{Credential, CredentialStore};
use crate::http::{ApiClient, ApiError, ApiRequest};

pub use refresh::{RefreshCoordinator, RefreshError, RefreshOutcome, TokenRefresher};

/// Why the session is signed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    /// No credential was ever stored.
    NeverSignedIn,
    /// The user logged out.
    UserLogout,
    /// Refresh failed; the UI should send the user to the login screen.
    SessionExpired,
}

/// Authentication state as observed by the rest of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// A credential is present.
    SignedIn,
    /// No usable credential.
    SignedOut {
        /// What ended (or never started) the session.
        reason: SignOutReason,
    },
}

impl AuthState {
    /// Returns `true` for [`AuthState::SignedIn`].
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::SignedIn)
    }
}

/// Publisher of [`AuthState`] transitions.
#[derive(Debug)]
pub struct AuthStatus {
    tx: watch::Sender<AuthState>,
}

impl AuthStatus {
    /// Start in `initial`.
    pub fn new(initial: AuthState) -> Self {
        Self {
            tx: watch::Sender::new(initial),
        }
    }

    /// Start signed in if the store already holds a credential.
    pub fn for_store(store: &CredentialStore) -> Self {
        if store.is_present() {
            Self::new(AuthState::SignedIn)
        } else {
            Self::new(AuthState::SignedOut {
                reason: SignOutReason::NeverSignedIn,
            })
        }
    }

    /// Current state.
    pub fn current(&self) -> AuthState {
        *self.tx.borrow()
    }

    /// Watch future transitions.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }

    /// Move to `SignedIn`. Returns `true` if this was a transition.
    pub fn signed_in(&self) -> bool {
        self.transition(AuthState::SignedIn)
    }

    /// Move to `SignedOut`. Returns `true` if this was a transition.
    pub fn signed_out(&self, reason: SignOutReason) -> bool {
        self.transition(AuthState::SignedOut { reason })
    }

    fn transition(&self, next: AuthState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }
}

/// Subscription tier of the signed-in account.
///
/// The API reports it as a number from login and as a name from the
/// profile endpoint; both forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum SubscriptionTier {
    /// Free tier (also used for unknown values).
    #[default]
    Free,
    /// Starter tier.
    Starter,
    /// Growth tier.
    Growth,
    /// Pro tier.
    Pro,
}

impl<'de> Deserialize<'de> for SubscriptionTier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Index(u64),
            Name(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Index(1) => Self::Starter,
            Repr::Index(2) => Self::Growth,
            Repr::Index(3) => Self::Pro,
            Repr::Index(_) => Self::Free,
            Repr::Name(name) => match name.as_str() {
                "Starter" => Self::Starter,
                "Growth" => Self::Growth,
                "Pro" => Self::Pro,
                _ => Self::Free,
            },
        })
    }
}

/// Body of `POST /auth/login`.
#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
    /// TOTP code when the account has two-factor enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_factor_code: Option<String>,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("two_factor_code", &self.two_factor_code.is_some())
            .finish_non_exhaustive()
    }
}

/// Response from `POST /auth/login`.
#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Bearer token; empty when a second factor is still required.
    #[serde(default)]
    pub token: String,
    /// Account email.
    pub email: String,
    /// Subscription tier.
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    /// The server wants a two-factor code before issuing a session.
    #[serde(default)]
    pub two_factor_required: bool,
}

impl std::fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginResponse")
            .field("email", &self.email)
            .field("subscription_tier", &self.subscription_tier)
            .field("two_factor_required", &self.two_factor_required)
            .finish_non_exhaustive()
    }
}

/// The signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    /// Account email.
    pub email: String,
    /// Subscription tier.
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
}

/// Login, logout and the signed-in account.
#[derive(Debug, Clone)]
pub struct AuthSession {
    api: ApiClient,
    store: Arc<CredentialStore>,
    status: Arc<AuthStatus>,
    user: Arc<RwLock<Option<CurrentUser>>>,
}

impl AuthSession {
    /// Build a session on top of an existing client, store and status.
    pub fn new(api: ApiClient, store: Arc<CredentialStore>, status: Arc<AuthStatus>) -> Self {
        Self {
            api,
            store,
            status,
            user: Arc::new(RwLock::new(None)),
        }
    }

    /// Sign in with email and password.
    ///
    /// When the server asks for a second factor, nothing is stored and the
    /// caller should retry with `two_factor_code` set.
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        let response: LoginResponse = self
            .api
            .execute(ApiRequest::post("/auth/login").json(body))
            .await?
            .json()?;

        if response.two_factor_required || response.token.is_empty() {
            log::info!("Login for {} requires a two-factor code", response.email);
            return Ok(response);
        }

        self.store.set(Credential::new(response.token.clone()));
        self.set_user(Some(CurrentUser {
            email: response.email.clone(),
            subscription_tier: response.subscription_tier,
        }));
        self.status.signed_in();
        log::info!("Signed in as {}", response.email);
        Ok(response)
    }

    /// Sign out locally: forget credential, cookies and account.
    pub fn logout(&self) {
        self.sign_out(SignOutReason::UserLogout);
    }

    /// Fetch the account profile. A failure signs the session out.
    pub async fn load_current_user(&self) -> Result<CurrentUser, ApiError> {
        let result = match self.api.execute(ApiRequest::get("/user/profile")).await {
            Ok(response) => response.json::<CurrentUser>(),
            Err(e) => Err(e),
        };

        match result {
            Ok(user) => {
                self.set_user(Some(user.clone()));
                Ok(user)
            }
            Err(e) => {
                log::error!("Failed to load user profile: {e}");
                if self.status.current().is_authenticated() {
                    self.sign_out(SignOutReason::SessionExpired);
                }
                Err(e)
            }
        }
    }

    /// Whether the session is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.status.current().is_authenticated()
    }

    /// Current bearer credential.
    pub fn token(&self) -> Option<Credential> {
        self.store.get()
    }

    /// Account loaded by login or [`Self::load_current_user`].
    pub fn current_user(&self) -> Option<CurrentUser> {
        self.user.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Watch sign-in transitions.
    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.status.subscribe()
    }

    fn sign_out(&self, reason: SignOutReason) {
        self.store.clear();
        self.api.reset_cookies();
        self.set_user(None);
        self.status.signed_out(reason);
        log::info!("Signed out ({reason:?})");
    }

    fn set_user(&self, user: Option<CurrentUser>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user;
    }
}
