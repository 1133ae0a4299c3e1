//! Shared helpers for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acord_session::credentials::Credential;
use acord_session::push::{Disconnect, Invocation, PushConnection, PushError, PushTransport};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

type Link = mpsc::UnboundedSender<Result<Invocation, Disconnect>>;

/// Scriptable stand-in for the push hub.
#[derive(Debug, Default)]
pub struct FakeHub {
    dials: Mutex<Vec<(Instant, String)>>,
    links: Mutex<Vec<Link>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that dials this hub.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn PushTransport> {
        Arc::new(FakeTransport {
            hub: Arc::clone(self),
        })
    }

    /// Reject the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject every connection attempt until turned off.
    pub fn fail_always(&self, on: bool) {
        self.fail_always.store(on, Ordering::SeqCst);
    }

    /// Number of connection attempts so far.
    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    /// When each connection attempt happened.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    /// Token presented on the last connection attempt.
    pub fn last_token(&self) -> Option<String> {
        self.dials.lock().unwrap().last().map(|(_, token)| token.clone())
    }

    /// Connections currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most connections ever open at the same time.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Send an invocation on the newest connection.
    pub fn send(&self, target: &str, payload: serde_json::Value) {
        self.newest_link()
            .send(Ok(Invocation::new(target, payload)))
            .unwrap();
    }

    /// Drop the newest connection as a network failure would.
    pub fn drop_connection(&self) {
        let _ = self
            .newest_link()
            .send(Err(Disconnect::transient("connection reset")));
    }

    /// Close the newest connection and forbid reconnecting.
    pub fn close_for_good(&self) {
        let _ = self
            .newest_link()
            .send(Err(Disconnect::terminal("server shutting down")));
    }

    fn newest_link(&self) -> Link {
        self.links.lock().unwrap().last().cloned().expect("no connection yet")
    }
}

#[derive(Debug)]
struct FakeTransport {
    hub: Arc<FakeHub>,
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn PushConnection>, PushError> {
        let hub = &self.hub;
        hub.dials
            .lock()
            .unwrap()
            .push((Instant::now(), credential.expose().to_string()));

        if hub.fail_always.load(Ordering::SeqCst) {
            return Err(PushError::Transport("connection refused".to_string()));
        }
        let remaining = hub.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            hub.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(PushError::Handshake("hub rejected handshake".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        hub.links.lock().unwrap().push(tx);
        let live = hub.live.fetch_add(1, Ordering::SeqCst) + 1;
        hub.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeConnection {
            rx,
            hub: Arc::clone(hub),
        }))
    }
}

struct FakeConnection {
    rx: mpsc::UnboundedReceiver<Result<Invocation, Disconnect>>,
    hub: Arc<FakeHub>,
}

#[async_trait]
impl PushConnection for FakeConnection {
    async fn next_event(&mut self) -> Result<Invocation, Disconnect> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(Disconnect::transient("link gone")),
        }
    }

    async fn close(&mut self) {}
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.hub.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `condition` every 10ms until it holds, panicking after `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
