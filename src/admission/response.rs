//! Quota headers and the 429 response.

use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::ratelimit::RateLimitDecision;

/// `X-RateLimit-Limit`
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`, unix seconds
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Machine-readable code carried by every 429 body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

const RATE_LIMIT_MESSAGE: &str = "Too many requests, please try again later.";

/// JSON error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// The error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    pub status_code: u16,
    pub code: String,
}

impl ErrorBody {
    /// The body sent with every rate limit denial.
    pub fn rate_limited() -> Self {
        Self {
            error: ErrorDetail {
                message: RATE_LIMIT_MESSAGE.to_string(),
                status_code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                code: RATE_LIMIT_EXCEEDED.to_string(),
            },
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode error body");
            String::from(r#"{"error":{"message":"Too many requests","statusCode":429,"code":"RATE_LIMIT_EXCEEDED"}}"#)
        })
    }
}

/// Attach quota headers for `decision`; `Retry-After` only on denial.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix_secs()));

    if let Some(retry_after) = decision.retry_after_secs {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

/// Build the 429 response for a denied decision.
pub fn too_many_requests<B: From<String>>(decision: &RateLimitDecision) -> Response<B> {
    let mut response = Response::new(B::from(ErrorBody::rate_limited().to_json()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_rate_limit_headers(headers, decision);
    // A denial always names a positive wait, even if the window just rolled
    if decision.retry_after_secs.is_none() {
        headers.insert(RETRY_AFTER, HeaderValue::from(1u64));
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn denied() -> RateLimitDecision {
        RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_time: Utc.timestamp_millis_opt(1_700_000_060_900).unwrap(),
            retry_after_secs: Some(42),
        }
    }

    #[test]
    fn test_too_many_requests_contract() {
        let response: Response<String> = too_many_requests(&denied());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000060");
        assert_eq!(headers[RETRY_AFTER], "42");

        let body: ErrorBody = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body, ErrorBody::rate_limited());

        let raw: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(raw["error"]["statusCode"], 429);
        assert_eq!(raw["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(raw["error"]["message"], "Too many requests, please try again later.");
    }

    #[test]
    fn test_body_matches_serialized_envelope() {
        let body = ErrorBody::rate_limited();
        assert_eq!(body.to_json(), serde_json::to_string(&body).unwrap());

        let raw: serde_json::Value = serde_json::from_str(&body.to_json()).unwrap();
        let detail = raw["error"].as_object().unwrap();
        assert_eq!(detail.len(), 3);
        assert!(detail.contains_key("statusCode"));
        assert!(!detail.contains_key("status_code"));
    }

    #[test]
    fn test_allowed_headers_have_no_retry_after() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 10,
            remaining: 7,
            reset_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            retry_after_secs: None,
        };

        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &decision);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "10");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "7");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000000");
        assert!(!headers.contains_key(RETRY_AFTER));
    }
}
