//! Authenticated request/response client.
//!
//! One instance is shared process-wide. Every request carries the bearer
//! token from the encrypted token store; `401` clears the token, persists a
//! sanitized return path, and surfaces [`ApiError::AuthExpired`] so the
//! embedding shell can navigate to the login page.

use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use wegent_core::kv::{KvStore, POST_LOGIN_REDIRECT_KEY};
use wegent_core::redirect::sanitize_redirect_path;
use wegent_core::token::TokenStore;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const LOGIN_PATH: &str = "/login";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors the transport surfaces to callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Authentication expired")]
    AuthExpired {
        /// Sanitized path to return to after login, if one could be computed.
        redirect: Option<String>,
    },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Network(format!("Connection failed: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// Authenticated HTTP client over the backend's request/response APIs.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    kv: Arc<Mutex<KvStore>>,
    /// Route the embedding shell currently displays; used as the post-login
    /// return target when a request hits 401.
    current_route: Mutex<Option<String>>,
}

impl ApiClient {
    /// Create a client for the given base URL (e.g. `https://host/api`).
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenStore>, kv: Arc<Mutex<KvStore>>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            kv,
            current_route: Mutex::new(None),
        }
    }

    /// Record the route the shell currently displays.
    pub fn set_current_route(&self, route: impl Into<String>) {
        *self.current_route.lock() = Some(route.into());
    }

    /// The base URL requests are issued against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying reqwest client (shared by the streaming chat path).
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn bearer_token(&self) -> Option<String> {
        self.tokens.load()
    }

    // -- Verbs ---------------------------------------------------------------

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ApiError> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, ApiError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, ApiError> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ApiError> {
        self.request(Method::DELETE, path, None::<&()>).await
    }

    // -- Core ----------------------------------------------------------------

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<T>, ApiError> {
        let mut req = self
            .http
            .request(method, self.endpoint(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = self.tokens.load() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(ApiError::from_reqwest)?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(self.handle_unauthorized());
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: extract_detail(&text),
            });
        }

        let parsed = resp
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(Some(parsed))
    }

    /// Clear the stored token, persist a sanitized return path, and build the
    /// auth-expired error. Shared by the request/response and streaming paths.
    pub(crate) fn handle_unauthorized(&self) -> ApiError {
        if let Err(e) = self.tokens.clear() {
            warn!("Failed to clear token after 401: {e}");
        }

        let redirect = self
            .current_route
            .lock()
            .as_deref()
            // Already on the login page: just reload, no return path.
            .filter(|route| !route.starts_with(LOGIN_PATH))
            .and_then(sanitize_redirect_path);

        if let Some(ref path) = redirect {
            if let Err(e) = self.kv.lock().set(POST_LOGIN_REDIRECT_KEY, path) {
                warn!("Failed to persist post-login redirect: {e}");
            }
            debug!("Authentication expired, return path {path}");
        }

        ApiError::AuthExpired { redirect }
    }
}

/// The login URL for an auth-expired error, carrying the encoded return path.
pub fn login_url(redirect: Option<&str>) -> String {
    match redirect {
        Some(path) => format!("{LOGIN_PATH}?redirect={}", urlencoding::encode(path)),
        None => LOGIN_PATH.to_string(),
    }
}

/// Extract a server error message from a response body: `{detail}` when the
/// body is JSON carrying one, the raw text otherwise.
fn extract_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    body.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(tmp: &tempfile::TempDir) -> ApiClient {
        let tokens = Arc::new(
            TokenStore::at(&tmp.path().join("token.enc"), &tmp.path().join("salt")).unwrap(),
        );
        let kv = Arc::new(Mutex::new(KvStore::open_in_memory().unwrap()));
        ApiClient::new("https://wegent.example/api/", tokens, kv)
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let tmp = tempfile::tempdir().unwrap();
        let client = test_client(&tmp);
        assert_eq!(client.endpoint("/chat/stream"), "https://wegent.example/api/chat/stream");
    }

    #[test]
    fn extract_detail_prefers_json_field() {
        assert_eq!(extract_detail(r#"{"detail":"team not found"}"#), "team not found");
    }

    #[test]
    fn extract_detail_falls_back_to_text() {
        assert_eq!(extract_detail("upstream exploded"), "upstream exploded");
        assert_eq!(extract_detail(r#"{"message":"no detail key"}"#), r#"{"message":"no detail key"}"#);
    }

    #[test]
    fn unauthorized_clears_token_and_stores_redirect() {
        let tmp = tempfile::tempdir().unwrap();
        let client = test_client(&tmp);
        client.tokens.save("stale-token").unwrap();
        client.set_current_route("/tasks?taskId=5#x");

        let err = client.handle_unauthorized();
        match err {
            ApiError::AuthExpired { redirect } => {
                assert_eq!(redirect.as_deref(), Some("/tasks?taskId=5#x"));
            }
            other => panic!("expected AuthExpired, got {other:?}"),
        }

        assert!(client.tokens.load().is_none());
        let stored = client.kv.lock().get(POST_LOGIN_REDIRECT_KEY).unwrap();
        assert_eq!(stored.as_deref(), Some("/tasks?taskId=5#x"));
    }

    #[test]
    fn unauthorized_on_login_page_has_no_redirect() {
        let tmp = tempfile::tempdir().unwrap();
        let client = test_client(&tmp);
        client.set_current_route("/login?redirect=%2Ftasks");

        match client.handle_unauthorized() {
            ApiError::AuthExpired { redirect } => assert!(redirect.is_none()),
            other => panic!("expected AuthExpired, got {other:?}"),
        }
    }

    #[test]
    fn unauthorized_rejects_unsafe_route() {
        let tmp = tempfile::tempdir().unwrap();
        let client = test_client(&tmp);
        client.set_current_route("//evil.com");

        match client.handle_unauthorized() {
            ApiError::AuthExpired { redirect } => assert!(redirect.is_none()),
            other => panic!("expected AuthExpired, got {other:?}"),
        }
    }

    #[test]
    fn login_url_encodes_redirect() {
        assert_eq!(
            login_url(Some("/tasks?taskId=5")),
            "/login?redirect=%2Ftasks%3FtaskId%3D5"
        );
        assert_eq!(login_url(None), "/login");
    }
}
