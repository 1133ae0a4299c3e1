//! Authenticated API client.
//!
//! [`ApiClient::execute`] is the request interceptor: it attaches the
//! current credential, and when a request comes back 401 it hands recovery
//! to the [`RefreshCoordinator`] and replays the request once with the
//! refreshed credential. Callers only ever see the final outcome.
//!
//! # Flow
//!
//! ```text
//!   execute(req)
//!       │ attach bearer (unless /auth/refresh), cookies for /auth/*
//!       ▼
//!   send ──► 2xx/4xx/5xx ───────────────────────────────► result
//!       │ 401
//!       ├── /auth/login   ──────────────────────────────► Status(401)
//!       ├── /auth/refresh ──► sign out ─────────────────► SessionExpired
//!       └── otherwise     ──► recover() ──► replay once ► result
//!                                  └─ failed ───────────► SessionExpired
//! ```

pub mod request;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::auth::{AuthStatus, RefreshCoordinator, RefreshError, SignOutReason, TokenRefresher};
use crate::credentials::CredentialStore;

pub use request::{ApiRequest, ApiResponse, EndpointKind};
pub use transport::HttpTransport;

/// Errors surfaced to callers of [`ApiClient::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request could not be built (bad URL, unserializable body).
    InvalidRequest(String),
    /// Transport failure before a status code was received.
    Network(String),
    /// Final non-2xx response.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// The credential expired and could not be refreshed. The session has
    /// been signed out.
    SessionExpired(RefreshError),
    /// The response body did not match the expected shape.
    Decode(String),
}

impl ApiError {
    /// HTTP status for [`ApiError::Status`].
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the session was torn down by this failure.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::Network(msg) => write!(f, "Network error: {msg}"),
            Self::Status { status, body } if body.is_empty() => write!(f, "Server returned {status}"),
            Self::Status { status, body } => {
                let shown = body.char_indices().nth(200).map_or(body.as_str(), |(i, _)| &body[..i]);
                write!(f, "Server returned {status}: {shown}")
            }
            Self::SessionExpired(cause) => write!(f, "Session expired: {cause}"),
            Self::Decode(msg) => write!(f, "Unexpected response body: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Request interceptor over [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    transport: Arc<HttpTransport>,
    store: Arc<CredentialStore>,
    status: Arc<AuthStatus>,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    /// Build a client whose refresh calls go through the same transport.
    pub fn new(
        transport: Arc<HttpTransport>,
        store: Arc<CredentialStore>,
        status: Arc<AuthStatus>,
        refresh_timeout: Duration,
    ) -> Self {
        let refresher: Arc<dyn TokenRefresher> = Arc::clone(&transport) as Arc<dyn TokenRefresher>;
        let refresh = RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&status),
            refresher,
            refresh_timeout,
        );
        Self {
            transport,
            store,
            status,
            refresh,
        }
    }

    /// The coordinator shared by every clone of this client.
    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    /// Drop in-memory session cookies.
    pub fn reset_cookies(&self) {
        self.transport.reset_cookies();
    }

    /// Send `request`, recovering transparently from an expired credential.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let kind = request.kind();
        let credential = match kind {
            EndpointKind::Refresh => None,
            _ => self.store.get(),
        };

        let response = self.transport.send(&request, credential.as_ref()).await?;
        if response.status() != 401 {
            return response.into_result();
        }

        if kind == EndpointKind::Refresh {
            log::warn!("[Http] Refresh endpoint rejected the session; signing out");
            self.expire_session();
            return Err(ApiError::SessionExpired(RefreshError::Rejected { status: 401 }));
        }
        if !kind.is_recoverable() {
            return response.into_result();
        }

        log::debug!(
            "[Http] {} {} returned 401, recovering",
            request.method(),
            request.path()
        );
        let fresh = match self.refresh.recover(credential.as_ref()).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.transport.reset_cookies();
                return Err(ApiError::SessionExpired(e));
            }
        };

        self.transport.send(&request, Some(&fresh)).await?.into_result()
    }

    /// [`Self::execute`] and decode the body as JSON.
    pub async fn json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.execute(request).await?.json()
    }

    fn expire_session(&self) {
        self.store.clear();
        self.transport.reset_cookies();
        self.status.signed_out(SignOutReason::SessionExpired);
    }
}
