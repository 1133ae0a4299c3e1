//! Raw HTTP sending with a bearer header and an opt-in cookie jar.
//!
//! The jar plays the role of the browser's `withCredentials` flag: cookies
//! are attached to, and captured from, only the requests that opt in. The
//! `reqwest` client itself has no cookie provider.
//!
//! Cookies captured from `/auth/*` responses are mirrored into the
//! credential store so the refresh cookie survives a restart.
//!
//! This module never interprets status codes; recovery is the
//! interceptor's job.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE};
use reqwest::Url;
use serde::Deserialize;

use super::{ApiError, ApiRequest, ApiResponse};
use crate::auth::{RefreshError, RefreshOutcome, TokenRefresher};
use crate::credentials::{Credential, CredentialStore};

/// Body of a successful `POST /auth/refresh`.
#[derive(Deserialize)]
struct RefreshResponse {
    token: String,
}

/// Sends [`ApiRequest`]s to the API base URL.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    jar: RwLock<Arc<Jar>>,
    store: Arc<CredentialStore>,
}

impl HttpTransport {
    /// Create a transport for `base_url` (including the `/api` prefix).
    ///
    /// The jar is seeded with cookies persisted by earlier runs.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        store: Arc<CredentialStore>,
    ) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid API URL {base_url}: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {e}")))?;

        let jar = Jar::default();
        for cookie in store.session_cookies() {
            jar.add_cookie_str(&cookie, &base);
        }

        Ok(Self {
            client,
            base_url,
            jar: RwLock::new(Arc::new(jar)),
            store,
        })
    }

    /// API base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Drop every cookie held in memory.
    pub fn reset_cookies(&self) {
        *self.jar.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Jar::default());
    }

    fn jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url, ApiError> {
        let raw = format!("{}{}", self.base_url, request.path());
        Url::parse(&raw).map_err(|e| ApiError::InvalidRequest(format!("invalid URL {raw}: {e}")))
    }

    /// Send `request` once, optionally with a bearer credential.
    ///
    /// The cookie jar is used for auth endpoints and for every request that
    /// carries a bearer.
    pub async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&Credential>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url_for(request)?;
        let with_credentials = request.kind().is_auth() || bearer.is_some();

        let mut builder = self.client.request(request.method().clone(), url.clone());
        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(credential) = bearer {
            builder = builder.header(AUTHORIZATION, credential.bearer());
        }
        let jar = self.jar();
        if with_credentials {
            if let Some(cookies) = jar.cookies(&url) {
                builder = builder.header(COOKIE, cookies);
            }
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        log::debug!("[Http] {} {}", request.method(), request.path());
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status().as_u16();

        if with_credentials {
            let set_cookies: Vec<HeaderValue> =
                response.headers().get_all(SET_COOKIE).iter().cloned().collect();
            if !set_cookies.is_empty() {
                jar.set_cookies(&mut set_cookies.iter(), &url);
                if request.kind().is_auth() {
                    let raw: Vec<String> = set_cookies
                        .iter()
                        .filter_map(|v| v.to_str().ok().map(str::to_string))
                        .collect();
                    self.store.remember_cookies(&raw);
                }
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read response body: {e}")))?;
        Ok(ApiResponse::new(status, body))
    }
}

#[async_trait]
impl TokenRefresher for HttpTransport {
    async fn refresh(&self) -> RefreshOutcome {
        let request = ApiRequest::post("/auth/refresh").json(serde_json::json!({}));
        let response = self.send(&request, None).await.map_err(|e| match e {
            ApiError::Network(msg) => RefreshError::Network(msg),
            other => RefreshError::Network(other.to_string()),
        })?;

        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status(),
            });
        }

        let parsed: RefreshResponse = serde_json::from_str(response.text())
            .map_err(|e| RefreshError::Malformed(e.to_string()))?;
        if parsed.token.is_empty() {
            return Err(RefreshError::Malformed("empty token".to_string()));
        }
        Ok(Credential::new(parsed.token))
    }
}
