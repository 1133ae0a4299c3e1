//! Replayable request description and buffered response.
//!
//! A request is kept as plain data rather than a `reqwest::Request` so the
//! interceptor can rebuild it for the replay with a different credential.

use reqwest::Method;
use serde::de::DeserializeOwned;

use super::ApiError;

/// Which part of the auth protocol a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// `/auth/login`: a 401 is a wrong password, not an expired token.
    Login,
    /// `/auth/refresh`: never carries a bearer, never triggers a refresh.
    Refresh,
    /// Any other `/auth/*` endpoint.
    Auth,
    /// Everything else.
    Business,
}

impl EndpointKind {
    /// Classify a path relative to the API base.
    pub fn of(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        if path.contains("/auth/refresh") {
            Self::Refresh
        } else if path.contains("/auth/login") {
            Self::Login
        } else if path.contains("/auth/") {
            Self::Auth
        } else {
            Self::Business
        }
    }

    /// Auth endpoints always travel with the session cookie.
    pub fn is_auth(self) -> bool {
        !matches!(self, Self::Business)
    }

    /// Whether a 401 from this endpoint may be recovered by refreshing.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Auth | Self::Business)
    }
}

/// An API call that can be sent more than once.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// Request with an arbitrary method. `path` is relative to the API base.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            method,
            path,
            query: Vec::new(),
            body: None,
        }
    }

    /// `GET path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path`.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// `PUT path`.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// `DELETE path`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path relative to the API base, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters in insertion order.
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// JSON body, if any.
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    /// Auth-protocol classification of the target.
    pub fn kind(&self) -> EndpointKind {
        EndpointKind::of(&self.path)
    }
}

/// Fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    status: u16,
    body: String,
}

impl ApiResponse {
    /// Build a response from its parts.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Raw body text.
    pub fn text(&self) -> &str {
        &self.body
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Turn a non-2xx response into [`ApiError::Status`].
    pub fn into_result(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::Status {
                status: self.status,
                body: self.body,
            })
        }
    }
}
