//! Session wiring: sign-in state drives the push channel and the inbox.

mod common;

use std::time::Duration;

use acord_session::auth::LoginRequest;
use acord_session::credentials::{FileStorage, MemoryStorage, StoredSession};
use acord_session::push::ConnectionState;
use acord_session::{AuthState, Config, SessionContext, SignOutReason};
use common::{eventually, FakeHub};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LIMIT: Duration = Duration::from_secs(5);

fn config_for(server: &MockServer) -> Config {
    Config {
        api_url: format!("{}/api", server.uri()),
        request_timeout_secs: 5,
        ..Config::default()
    }
}

fn stored(token: &str) -> Box<MemoryStorage> {
    Box::new(MemoryStorage::with_session(StoredSession {
        access_token: Some(token.to_string()),
        ..StoredSession::default()
    }))
}

fn notification(id: &str, is_read: bool) -> serde_json::Value {
    json!({
        "id": id,
        "title": "Processing complete",
        "message": "acord25.pdf is ready",
        "type": "DocumentProcessing",
        "isRead": is_read,
        "createdAt": "2026-01-05T10:00:00Z"
    })
}

#[tokio::test]
async fn test_signed_in_session_connects_and_loads_inbox() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/notifications"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            notification("n-2", false),
            notification("n-1", true)
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let hub = FakeHub::new();
    let session = SessionContext::with_parts(&config_for(&server), stored("tok"), hub.transport())
        .unwrap();
    assert!(session.auth().is_authenticated());

    let watcher = session.spawn_auth_watcher();
    eventually(LIMIT, || {
        session.push().is_connected() && session.inbox().notifications().len() == 2
    })
    .await;
    assert_eq!(hub.last_token().as_deref(), Some("tok"));
    assert_eq!(session.inbox().unread_count(), 1);

    // Live notifications land in the inbox through the bus
    hub.send("Notification", notification("n-3", false));
    eventually(LIMIT, || session.inbox().unread_count() == 2).await;
    assert_eq!(session.inbox().notifications()[0].id, "n-3");

    watcher.abort();
    session.shutdown().await;
}

#[tokio::test]
async fn test_logout_closes_channel_and_empties_inbox() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/notifications"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([notification("n-1", false)])),
        )
        .mount(&server)
        .await;

    let hub = FakeHub::new();
    let session = SessionContext::with_parts(&config_for(&server), stored("tok"), hub.transport())
        .unwrap();
    let watcher = session.spawn_auth_watcher();
    eventually(LIMIT, || {
        session.push().is_connected() && session.inbox().unread_count() == 1
    })
    .await;

    session.auth().logout();

    eventually(LIMIT, || {
        session.push().state() == ConnectionState::Disconnected && hub.live() == 0
    })
    .await;
    eventually(LIMIT, || session.inbox().notifications().is_empty()).await;
    assert_eq!(session.inbox().unread_count(), 0);
    assert!(!session.store().is_present());
    assert_eq!(
        session.status().current(),
        AuthState::SignedOut {
            reason: SignOutReason::UserLogout
        }
    );

    watcher.abort();
}

#[tokio::test]
async fn test_signed_out_session_stays_offline() {
    let server = MockServer::start().await;
    let hub = FakeHub::new();
    let session = SessionContext::with_parts(
        &config_for(&server),
        Box::new(MemoryStorage::default()),
        hub.transport(),
    )
    .unwrap();

    let watcher = session.spawn_auth_watcher();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(hub.dial_count(), 0);
    assert_eq!(session.push().state(), ConnectionState::Disconnected);
    assert!(server.received_requests().await.unwrap().is_empty());
    watcher.abort();
}

#[tokio::test]
async fn test_login_persists_across_restarts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "refreshToken=abc; Path=/api/auth; HttpOnly")
                .set_body_json(json!({
                    "token": "persisted",
                    "email": "agent@example.com",
                    "subscriptionTier": 1,
                    "twoFactorRequired": false
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("session.json");
    let config = config_for(&server);

    let first = SessionContext::with_parts(
        &config,
        Box::new(FileStorage::new(&file)),
        FakeHub::new().transport(),
    )
    .unwrap();
    assert!(!first.auth().is_authenticated());
    first
        .auth()
        .login(&LoginRequest {
            email: "agent@example.com".to_string(),
            password: "hunter2".to_string(),
            two_factor_code: None,
        })
        .await
        .unwrap();
    drop(first);

    let second = SessionContext::with_parts(
        &config,
        Box::new(FileStorage::new(&file)),
        FakeHub::new().transport(),
    )
    .unwrap();
    assert!(second.auth().is_authenticated());
    assert_eq!(second.auth().token().unwrap().expose(), "persisted");
    assert_eq!(second.store().session_cookies().len(), 1);
}
