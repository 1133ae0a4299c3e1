//! Request interceptor against a mock API server.
//!
//! Covers transparent token refresh: one refresh call for any number of
//! concurrent 401s, replay with the new token, sign-out when refresh
//! fails, and the endpoints that must never trigger a refresh.

use std::sync::Arc;
use std::time::Duration;

use acord_session::auth::{AuthSession, LoginRequest, RefreshError};
use acord_session::http::{ApiClient, ApiError, ApiRequest, HttpTransport};
use acord_session::{AuthState, AuthStatus, Credential, CredentialStore, SignOutReason};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    store: Arc<CredentialStore>,
    status: Arc<AuthStatus>,
    api: ApiClient,
}

/// Client pointed at `server`, optionally signed in with `token`.
fn harness(server: &MockServer, token: Option<&str>) -> Harness {
    let store = Arc::new(CredentialStore::in_memory());
    if let Some(token) = token {
        store.set(Credential::new(token));
    }
    let status = Arc::new(AuthStatus::for_store(&store));
    let transport = Arc::new(
        HttpTransport::new(
            &format!("{}/api", server.uri()),
            Duration::from_secs(5),
            Arc::clone(&store),
        )
        .unwrap(),
    );
    let api = ApiClient::new(
        transport,
        Arc::clone(&store),
        Arc::clone(&status),
        Duration::from_secs(5),
    );
    Harness { store, status, api }
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .and(header("authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "token": "new" }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "doc-1" }])))
        .expect(3)
        .mount(&server)
        .await;

    let h = harness(&server, Some("old"));
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let api = h.api.clone();
        tasks.push(tokio::spawn(async move {
            api.execute(ApiRequest::get("/documents")).await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap().expect("request should be replayed");
        assert_eq!(response.status(), 200);
    }

    assert_eq!(h.store.get(), Some(Credential::new("new")));
    assert_eq!(h.status.current(), AuthState::SignedIn);
    assert!(!h.api.refresh_coordinator().is_refreshing());
}

#[tokio::test]
async fn test_failed_refresh_signs_out_every_waiter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("old"));
    let (a, b) = tokio::join!(
        h.api.execute(ApiRequest::get("/documents")),
        h.api.execute(ApiRequest::get("/documents")),
    );

    for result in [a, b] {
        match result {
            Err(ApiError::SessionExpired(RefreshError::Rejected { status })) => {
                assert_eq!(status, 401);
            }
            // A 401 that lands after the sign-out does not refresh again
            Err(ApiError::SessionExpired(RefreshError::SessionEnded)) => {}
            other => panic!("expected session expiry, got {other:?}"),
        }
    }
    assert!(!h.store.is_present());
    assert_eq!(
        h.status.current(),
        AuthState::SignedOut {
            reason: SignOutReason::SessionExpired
        }
    );
}

#[tokio::test]
async fn test_logout_while_refreshing_stays_logged_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "token": "new" }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("old"));
    let auth = AuthSession::new(h.api.clone(), Arc::clone(&h.store), Arc::clone(&h.status));
    let pending = {
        let api = h.api.clone();
        tokio::spawn(async move { api.execute(ApiRequest::get("/documents")).await })
    };
    while !h.api.refresh_coordinator().is_refreshing() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    auth.logout();

    match pending.await.unwrap() {
        Err(ApiError::SessionExpired(RefreshError::SessionEnded)) => {}
        other => panic!("expected the session to stay ended, got {other:?}"),
    }
    assert!(!h.store.is_present());
    assert_eq!(
        h.status.current(),
        AuthState::SignedOut {
            reason: SignOutReason::UserLogout
        }
    );
}

#[tokio::test]
async fn test_direct_refresh_401_does_not_recurse() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, Some("old"));
    let result = h
        .api
        .execute(ApiRequest::post("/auth/refresh").json(json!({})))
        .await;

    assert!(result.unwrap_err().is_session_expired());
    assert!(!h.store.is_present());
    assert!(!h.status.current().is_authenticated());

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(
        !received[0].headers.contains_key("authorization"),
        "refresh must not carry the bearer"
    );
}

#[tokio::test]
async fn test_login_401_is_a_plain_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid email or password"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "new" })))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server, None);
    let auth = AuthSession::new(h.api.clone(), Arc::clone(&h.store), Arc::clone(&h.status));
    let err = auth
        .login(&LoginRequest {
            email: "agent@example.com".to_string(),
            password: "wrong".to_string(),
            two_factor_code: None,
        })
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(401));
    assert!(!err.is_session_expired());
    assert_eq!(
        h.status.current(),
        AuthState::SignedOut {
            reason: SignOutReason::NeverSignedIn
        }
    );
}

#[tokio::test]
async fn test_login_cookie_is_sent_to_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "refreshToken=abc; Path=/api/auth; HttpOnly")
                .set_body_json(json!({
                    "token": "first",
                    "email": "agent@example.com",
                    "subscriptionTier": 2,
                    "twoFactorRequired": false
                })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .and(header("authorization", "Bearer first"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(header("cookie", "refreshToken=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "second" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .and(header("authorization", "Bearer second"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let h = harness(&server, None);
    let auth = AuthSession::new(h.api.clone(), Arc::clone(&h.store), Arc::clone(&h.status));
    auth.login(&LoginRequest {
        email: "agent@example.com".to_string(),
        password: "hunter2".to_string(),
        two_factor_code: None,
    })
    .await
    .unwrap();
    assert!(auth.is_authenticated());
    assert_eq!(h.store.session_cookies().len(), 1);

    let response = h.api.execute(ApiRequest::get("/documents")).await.unwrap();
    assert_eq!(response.text(), "[]");
    assert_eq!(auth.token(), Some(Credential::new("second")));
}

#[tokio::test]
async fn test_server_error_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/dashboard"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "new" })))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server, Some("old"));
    match h.api.execute(ApiRequest::get("/dashboard")).await {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected a 500, got {other:?}"),
    }
    assert_eq!(h.store.get(), Some(Credential::new("old")));
    assert!(h.status.current().is_authenticated());
}
