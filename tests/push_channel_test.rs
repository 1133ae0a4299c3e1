//! Push channel lifecycle against a scripted hub, on paused time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use acord_session::events::{EventBus, ProcessingComplete};
use acord_session::push::{BackoffPolicy, ConnectionState, PushChannel, PushError};
use acord_session::{Credential, CredentialStore};
use common::{eventually, FakeHub};
use serde_json::json;

const LIMIT: Duration = Duration::from_secs(300);

fn channel(hub: &Arc<FakeHub>) -> (PushChannel, Arc<CredentialStore>) {
    let store = Arc::new(CredentialStore::in_memory());
    store.set(Credential::new("token-1"));
    let channel = PushChannel::new(
        hub.transport(),
        Arc::clone(&store),
        EventBus::new(),
        BackoffPolicy::default(),
    );
    (channel, store)
}

fn complete(document_id: &str) -> serde_json::Value {
    json!({
        "documentId": document_id,
        "success": true,
        "timestamp": "2026-01-05T10:00:00Z"
    })
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent_while_connected() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);

    channel.start().await.unwrap();
    channel.start().await.unwrap();
    channel.start_connection(&Credential::new("token-1")).await.unwrap();

    assert_eq!(hub.dial_count(), 1);
    assert_eq!(hub.live(), 1);
    assert!(channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_start_without_credential_fails() {
    let hub = FakeHub::new();
    let (channel, store) = channel(&hub);
    store.clear();

    assert_eq!(channel.start().await, Err(PushError::NotAuthenticated));
    assert_eq!(hub.dial_count(), 0);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);

    channel.stop_connection().await;
    channel.start().await.unwrap();
    channel.stop_connection().await;
    channel.stop_connection().await;

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(hub.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_initial_handshake_failure_is_not_retried() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);
    hub.fail_next(1);

    let err = channel.start().await.unwrap_err();
    assert!(matches!(err, PushError::Handshake(_)));
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_follows_backoff_schedule() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);
    channel.start().await.unwrap();
    let mut states = channel.connection_state();
    states.borrow_and_update();

    hub.fail_next(3);
    hub.drop_connection();

    states.changed().await.unwrap();
    assert!(matches!(
        *states.borrow_and_update(),
        ConnectionState::Reconnecting {
            persistent: false,
            ..
        }
    ));

    eventually(LIMIT, || channel.is_connected() && hub.dial_count() == 5).await;

    let times = hub.dial_times();
    let gaps: Vec<Duration> = times[2..]
        .iter()
        .zip(&times[1..])
        .map(|(later, earlier)| *later - *earlier)
        .collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_secs(10)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_long_outage_is_reported_as_persistent() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);
    channel.start().await.unwrap();

    hub.fail_always(true);
    hub.drop_connection();

    eventually(LIMIT, || {
        matches!(
            channel.state(),
            ConnectionState::Reconnecting {
                persistent: true,
                ..
            }
        )
    })
    .await;

    hub.fail_always(false);
    eventually(LIMIT, || channel.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn test_events_are_not_redelivered_after_reconnect() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);
    let mut completions = channel.bus().subscribe::<ProcessingComplete>();
    channel.start().await.unwrap();

    hub.send("ProcessingComplete", complete("doc-1"));
    assert_eq!(completions.recv().await.unwrap().document_id, "doc-1");

    hub.drop_connection();
    eventually(LIMIT, || channel.is_connected() && hub.dial_count() == 2).await;

    hub.send("ProcessingComplete", complete("doc-2"));
    assert_eq!(completions.recv().await.unwrap().document_id, "doc-2");
    assert!(completions.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_live_connection() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);
    channel.start().await.unwrap();

    for round in 2..=4 {
        hub.drop_connection();
        eventually(LIMIT, || channel.is_connected() && hub.dial_count() == round).await;
    }
    channel.stop_connection().await;
    channel.start().await.unwrap();

    assert_eq!(hub.max_live(), 1);
    assert_eq!(hub.live(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_credential_stops_reconnecting() {
    let hub = FakeHub::new();
    let (channel, store) = channel(&hub);
    channel.start().await.unwrap();

    store.clear();
    hub.drop_connection();

    eventually(LIMIT, || channel.state() == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.dial_count(), 1);
    assert_eq!(hub.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_without_reconnect_is_final() {
    let hub = FakeHub::new();
    let (channel, _store) = channel(&hub);
    channel.start().await.unwrap();

    hub.close_for_good();

    eventually(LIMIT, || channel.state() == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_uses_refreshed_token() {
    let hub = FakeHub::new();
    let (channel, store) = channel(&hub);
    channel.start().await.unwrap();
    assert_eq!(hub.last_token().as_deref(), Some("token-1"));

    store.set(Credential::new("token-2"));
    hub.drop_connection();

    eventually(LIMIT, || channel.is_connected() && hub.dial_count() == 2).await;
    assert_eq!(hub.last_token().as_deref(), Some("token-2"));
}
