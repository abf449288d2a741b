//! Policy service clients.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use super::policy::PolicyDocument;
use crate::error::{GatekeeperError, Result};

/// Errors fetching a policy document. All of them trigger the cache's
/// fallback chain.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("policy request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("policy service responded with HTTP {0}")]
    Status(u16),

    #[error("policy fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("policy document rejected: {0}")]
    Invalid(String),
}

/// Client platform the policy is requested for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Mobile,
    Web,
}

impl Platform {
    /// The query parameter value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mobile => "mobile",
            Platform::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Somewhere a policy document can be fetched from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch the current policy for `platform`.
    async fn fetch(&self, platform: Platform) -> std::result::Result<PolicyDocument, FetchError>;
}

/// Fetches policies with `GET {endpoint}?platform=<platform>`.
#[derive(Debug, Clone)]
pub struct HttpPolicySource {
    client: reqwest::Client,
    endpoint: Url,
    auth_token: Option<String>,
}

impl HttpPolicySource {
    /// Create a client for `endpoint`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| GatekeeperError::Config(format!("invalid policy endpoint '{}': {}", endpoint, e)))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            auth_token: None,
        })
    }

    /// Send `token` as a bearer credential to get user-specific policies.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn fetch(&self, platform: Platform) -> std::result::Result<PolicyDocument, FetchError> {
        let mut request = self
            .client
            .get(self.endpoint.clone())
            .query(&[("platform", platform.as_str())]);

        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        debug!(authenticated = self.auth_token.is_some(), "Fetching policy");

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::policy::StrategyMode;
    use axum::extract::Query;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn echo_policy(
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        let platform = params.get("platform").cloned().unwrap_or_default();
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("anonymous")
            .to_string();

        let body = serde_json::json!({
            "strategy": { "id": platform, "name": auth, "mode": "hard-soft", "can_skip": true },
            "trial": { "type": "time_based", "duration_days": 14 },
            "permissions": []
        });
        ([(header::CONTENT_TYPE, "application/json")], body.to_string())
    }

    #[tokio::test]
    async fn test_fetch_sends_platform_and_token() {
        let addr = serve(Router::new().route("/api/v1/config/paywall-strategy", get(echo_policy))).await;
        let source = HttpPolicySource::new(&format!("http://{}/api/v1/config/paywall-strategy", addr))
            .unwrap()
            .with_auth_token(Some("secret".to_string()));

        let doc = source.fetch(Platform::Web).await.unwrap();
        let strategy = doc.strategy.unwrap();
        assert_eq!(strategy.mode, Some(StrategyMode::HardSoft));
        assert_eq!(strategy.id.as_deref(), Some("web"));
        assert_eq!(strategy.name.as_deref(), Some("Bearer secret"));
        assert_eq!(doc.trial.duration_days, Some(14));
    }

    #[tokio::test]
    async fn test_fetch_without_token_is_anonymous() {
        let addr = serve(Router::new().route("/policy", get(echo_policy))).await;
        let source = HttpPolicySource::new(&format!("http://{}/policy", addr))
            .unwrap()
            .with_auth_token(Some(String::new()));

        let doc = source.fetch(Platform::Mobile).await.unwrap();
        let strategy = doc.strategy.unwrap();
        assert_eq!(strategy.id.as_deref(), Some("mobile"));
        assert_eq!(strategy.name.as_deref(), Some("anonymous"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let app = Router::new().route("/policy", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let addr = serve(app).await;
        let source = HttpPolicySource::new(&format!("http://{}/policy", addr)).unwrap();

        let err = source.fetch(Platform::Mobile).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(503)));
    }

    #[tokio::test]
    async fn test_malformed_document_is_failure() {
        let app = Router::new().route(
            "/policy",
            get(|| async { r#"{"strategy": {"mode": "whenever"}}"# }),
        );
        let addr = serve(app).await;
        let source = HttpPolicySource::new(&format!("http://{}/policy", addr)).unwrap();

        let err = source.fetch(Platform::Mobile).await.unwrap_err();
        assert!(matches!(err, FetchError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_modeless_strategy_is_accepted() {
        let app = Router::new().route(
            "/policy",
            get(|| async {
                r#"{"strategy": {"id": "BETA"}, "permissions": [{"feature_area": "voice_notes", "can_access": true, "access_level": "full"}, {"feature_area": "screenshots"}]}"#
            }),
        );
        let addr = serve(app).await;
        let source = HttpPolicySource::new(&format!("http://{}/policy", addr)).unwrap();

        let doc = source.fetch(Platform::Mobile).await.unwrap();
        assert_eq!(doc.mode(), None);
        assert_eq!(doc.permissions.len(), 1);
        assert!(doc.permission("voice_notes").unwrap().can_access);
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let err = HttpPolicySource::new("not a url").unwrap_err();
        assert!(matches!(err, GatekeeperError::Config(_)));
    }
}
