// HTTP client for the Dentika REST API.
//
// Every request carries the bearer token from the token store. A 401 on any
// request except login/logout fires the unauthorized hook; transport
// failures and received responses feed the network hooks the health
// monitor listens on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dentika_common::types::NotificationId;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::auth::TokenStore;
use crate::config::{ApiConfig, HealthConfig};
use crate::health::{HealthProbe, ProbeOutcome};
use crate::notifications::{NotificationBackfill, NotificationPage, PageQuery};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid API url: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// No response was received.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(_) => Some(401),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn classify(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(error.to_string())
    }
}

/// User-facing message for an error response: the body's `message`, then
/// its `error`, then a fallback by status.
pub fn error_message(status: u16, body: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = object.get(key).and_then(Value::as_str).filter(|text| !text.is_empty()) {
                return text.to_string();
            }
        }
    }
    match status {
        400 => "Invalid request. Please check your input.".to_string(),
        401 => "Invalid username or password.".to_string(),
        403 => "You do not have permission to perform this action.".to_string(),
        404 => "The requested resource was not found.".to_string(),
        422 => "Validation failed. Please check your input.".to_string(),
        500 => "Server error. Please try again later.".to_string(),
        other => format!("Request failed with status {other}"),
    }
}

/// Login and logout answer 401 for bad credentials; that is not a lost
/// session.
fn is_session_request(path: &str) -> bool {
    path.contains("/auth/login") || path.contains("/auth/logout")
}

/// `{success, data}` wrapper used by every JSON endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct UnreadCount {
    count: u64,
}

pub type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
struct Hooks {
    unauthorized: Option<Hook>,
    network_error: Option<Hook>,
    network_recovery: Option<Hook>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
    request_timeout: Duration,
    probe_path: String,
    probe_timeout: Duration,
    hooks: Arc<Mutex<Hooks>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient").field("base_url", &self.base_url).finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(api: &ApiConfig, health: &HealthConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        let parsed = Url::parse(&api.base_url).map_err(|error| ApiError::InvalidUrl(format!("{}: {error}", api.base_url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::InvalidUrl(format!("unsupported scheme `{}`", parsed.scheme())));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| ApiError::Network(error.to_string()))?;
        Ok(Self {
            http,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            tokens,
            request_timeout: api.request_timeout(),
            probe_path: health.probe_path.clone(),
            probe_timeout: health.probe_timeout(),
            hooks: Arc::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn on_unauthorized<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks_mut(|hooks| hooks.unauthorized = Some(Arc::new(hook)));
    }

    pub fn on_network_error<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks_mut(|hooks| hooks.network_error = Some(Arc::new(hook)));
    }

    pub fn on_network_recovery<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks_mut(|hooks| hooks.network_recovery = Some(Arc::new(hook)));
    }

    fn hooks_mut(&self, update: impl FnOnce(&mut Hooks)) {
        update(&mut self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }

    fn hooks(&self) -> Hooks {
        self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let mut request = self.http.request(method.clone(), self.url(path)).timeout(self.request_timeout);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        match self.tokens.get() {
            Ok(Some(token)) => request = request.bearer_auth(token),
            Ok(None) => {}
            Err(error) => warn!(error = %error, "failed to read auth token"),
        }

        let hooks = self.hooks();
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                let error = classify(error);
                warn!(%method, path, error = %error, "API request failed");
                if let Some(hook) = &hooks.network_error {
                    hook();
                }
                return Err(error);
            }
        };
        if let Some(hook) = &hooks.network_recovery {
            hook();
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = error_message(status.as_u16(), &body);
        debug!(%method, path, status = status.as_u16(), message = %message, "API request rejected");

        if status == StatusCode::UNAUTHORIZED {
            if !is_session_request(path) {
                if let Some(hook) = &hooks.unauthorized {
                    hook();
                }
            }
            return Err(ApiError::Unauthorized(message));
        }
        Err(ApiError::Status { status: status.as_u16(), message })
    }

    async fn data<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let envelope: Envelope<T> = response.json().await.map_err(|error| ApiError::Decode(error.to_string()))?;
        match envelope.data {
            Some(data) => Ok(data),
            None => Err(ApiError::Decode(format!("response has no data (success = {})", envelope.success))),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiError> {
        let response = self.send(Method::GET, path, query, None).await?;
        Self::data(response).await
    }

    /// Request whose response body is not needed.
    pub async fn execute(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(), ApiError> {
        self.send(method, path, &[], body).await.map(drop)
    }

    /// Invalidate the session server-side. A 401 here means it already is.
    pub async fn logout(&self) -> Result<(), ApiError> {
        match self.execute(Method::POST, "/api/auth/logout", None).await {
            Ok(()) | Err(ApiError::Unauthorized(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

impl NotificationBackfill for ApiClient {
    async fn fetch_page(&self, query: PageQuery) -> Result<NotificationPage, ApiError> {
        let params = [
            ("page", query.page.to_string()),
            ("limit", query.limit.to_string()),
            ("filter", query.filter.as_str().to_string()),
        ];
        self.get("/api/notifications", &params).await
    }

    async fn unread_count(&self) -> Result<u64, ApiError> {
        let count: UnreadCount = self.get("/api/notifications/unread-count", &[]).await?;
        Ok(count.count)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), ApiError> {
        self.execute(Method::PUT, &format!("/api/notifications/{id}/read"), None).await
    }

    async fn mark_all_read(&self) -> Result<(), ApiError> {
        self.execute(Method::PUT, "/api/notifications/mark-all-read", None).await
    }

    async fn dismiss(&self, id: &NotificationId) -> Result<(), ApiError> {
        self.execute(Method::PUT, &format!("/api/notifications/{id}/dismiss"), None).await
    }

    async fn send_test(&self) -> Result<(), ApiError> {
        self.execute(Method::POST, "/api/notifications/test", None).await
    }
}

impl HealthProbe for ApiClient {
    /// Unauthenticated; any status below 500 means the server answered.
    async fn probe(&self) -> ProbeOutcome {
        let result = self.http.get(self.url(&self.probe_path)).timeout(self.probe_timeout).send().await;
        match result {
            Ok(response) if response.status().is_server_error() => ProbeOutcome::ServerError(response.status().as_u16()),
            Ok(response) => ProbeOutcome::Reachable(response.status().as_u16()),
            Err(error) => ProbeOutcome::NoResponse(classify(error).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_prefers_body_fields() {
        assert_eq!(error_message(400, r#"{"message":"Bad date","error":"x"}"#), "Bad date");
        assert_eq!(error_message(500, r#"{"error":"Failed to fetch notifications"}"#), "Failed to fetch notifications");
        assert_eq!(error_message(404, "not json"), "The requested resource was not found.");
        assert_eq!(error_message(418, r#"{"message":""}"#), "Request failed with status 418");
    }

    #[test]
    fn login_and_logout_are_session_requests() {
        assert!(is_session_request("/api/auth/login"));
        assert!(is_session_request("/api/auth/logout"));
        assert!(!is_session_request("/api/notifications"));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let tokens: Arc<dyn TokenStore> = Arc::new(crate::auth::MemoryTokenStore::new());
        let api = ApiConfig { base_url: "ftp://example.com".into(), ..ApiConfig::default() };
        let error = ApiClient::new(&api, &HealthConfig::default(), tokens).unwrap_err();
        assert!(matches!(error, ApiError::InvalidUrl(_)));
    }

    #[test]
    fn network_errors_are_classified() {
        assert!(ApiError::Timeout.is_network());
        assert!(!ApiError::Unauthorized("x".into()).is_network());
        assert_eq!(ApiError::Status { status: 503, message: "down".into() }.status(), Some(503));
    }
}
