//! Seam between the channel lifecycle and the wire protocol.
//!
//! [`PushChannel`](super::PushChannel) only knows how to open a connection
//! with a credential and pull named events out of it. The SignalR
//! implementation lives in [`signalr`](super::signalr); tests substitute
//! their own.

use async_trait::async_trait;

use super::PushError;
use crate::credentials::Credential;

/// A named server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Topic name, e.g. `ProcessingProgress`.
    pub target: String,
    /// First argument of the invocation (`Null` when absent).
    pub payload: serde_json::Value,
}

impl Invocation {
    /// Build an invocation.
    pub fn new(target: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            target: target.into(),
            payload,
        }
    }
}

/// Why a live connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Human-readable cause.
    pub reason: String,
    /// `false` when the server asked the client not to come back.
    pub allow_reconnect: bool,
}

impl Disconnect {
    /// A drop the channel should recover from.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            allow_reconnect: true,
        }
    }

    /// A close the channel must not retry.
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            allow_reconnect: false,
        }
    }
}

/// One established connection.
#[async_trait]
pub trait PushConnection: Send {
    /// Wait for the next invocation, or for the connection to end.
    async fn next_event(&mut self) -> Result<Invocation, Disconnect>;

    /// Release the connection. Safe to call on a dead connection.
    async fn close(&mut self);
}

/// Opens connections to the push endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync + std::fmt::Debug {
    /// Connect and complete the protocol handshake.
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn PushConnection>, PushError>;
}
