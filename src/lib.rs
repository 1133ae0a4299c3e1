//! ACORD session - credential refresh and real-time event coordination.
//!
//! This crate owns the part of the ACORD parser client that has to get
//! concurrency right: the authenticated HTTP client that refreshes an
//! expired bearer token exactly once for a burst of failing requests, and
//! the push channel that keeps a single SignalR connection alive and fans
//! its events out to independent subscribers.
//!
//! # Architecture
//!
//! ```text
//!   caller ──► ApiClient ──► HttpTransport ──► API
//!                 │ 401
//!                 ▼
//!          RefreshCoordinator ──► CredentialStore ◄── AuthSession (login/logout)
//!                                       ▲
//!   AuthStatus ──► auth watcher ──► PushChannel ──► SignalR hub
//!                                       │
//!                                       ▼
//!                                   EventBus ──► NotificationStore, progress UI, ...
//! ```
//!
//! # Modules
//!
//! - [`credentials`] - Credential store and durable token storage
//! - [`auth`] - Sign-in state, login/logout and the refresh coordinator
//! - [`http`] - Request interceptor over `reqwest`
//! - [`push`] - Push channel lifecycle, backoff policy and SignalR transport
//! - [`events`] - Topic fanout bus and push payload types
//! - [`notifications`] - Notification inbox fed by the bus
//! - [`session`] - Wiring of all components into one session context
//! - [`config`] - Configuration loading/saving

pub mod auth;
pub mod config;
pub mod credentials;
pub mod events;
pub mod http;
pub mod notifications;
pub mod push;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use auth::{AuthSession, AuthState, AuthStatus, RefreshCoordinator, SignOutReason};
pub use config::Config;
pub use credentials::{Credential, CredentialStore};
pub use events::{EventBus, EventStream, PushEvent};
pub use http::{ApiClient, ApiError, ApiRequest, ApiResponse};
pub use notifications::NotificationStore;
pub use push::{BackoffPolicy, ConnectionState, PushChannel, PushError};
pub use session::SessionContext;
