//! Rate limit key generation.
//!
//! A key generator maps an inbound request to the opaque string its quota is
//! counted under, e.g. `api:user_123` or `public:203.0.113.7`.

use http::request::Parts;
use std::fmt;
use std::sync::Arc;

/// Fallback key when a policy has no generator.
pub const DEFAULT_KEY: &str = "default";

/// Identity of an authenticated caller, placed in request extensions by the
/// host's auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Derives the counter key for a request.
#[derive(Clone)]
pub struct KeyGenerator(Arc<dyn Fn(&Parts) -> String + Send + Sync>);

impl KeyGenerator {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Every request shares a single key.
    pub fn constant(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(move |_| key.clone())
    }

    /// Key by client address, e.g. `public:203.0.113.7`.
    pub fn client_ip(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |parts| format!("{}:{}", prefix, client_ip(parts)))
    }

    /// Key by authenticated user, e.g. `api:user_123`.
    pub fn user_id(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |parts| format!("{}:{}", prefix, user_id(parts)))
    }

    /// Compute the key for a request.
    pub fn key_for(&self, parts: &Parts) -> String {
        (self.0)(parts)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::constant(DEFAULT_KEY)
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyGenerator(..)")
    }
}

/// Best-effort client address.
///
/// Prefers the first hop of `x-forwarded-for`, then `x-real-ip`, then a
/// `SocketAddr` in the request extensions, then `unknown`.
pub fn client_ip(parts: &Parts) -> String {
    if let Some(forwarded) = header_str(parts, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }

    if let Some(real_ip) = header_str(parts, "x-real-ip") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    parts
        .extensions
        .get::<std::net::SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Authenticated user id, or `anonymous`.
pub fn user_id(parts: &Parts) -> String {
    parts
        .extensions
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone())
        .unwrap_or_else(|| "anonymous".to_string())
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}
