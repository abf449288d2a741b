//! Rate limiting wrapper for request handlers.

use async_trait::async_trait;
use http::{Request, Response};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::response::{apply_rate_limit_headers, too_many_requests};
use crate::ratelimit::{CounterStore, LimitTable, RateLimitPolicy, RateLimiter};

/// An async request handler.
#[async_trait]
pub trait Handler<ReqBody, ResBody>: Send + Sync {
    /// Handle one request.
    async fn call(&self, request: Request<ReqBody>) -> Response<ResBody>;
}

#[async_trait]
impl<F, Fut, ReqBody, ResBody> Handler<ReqBody, ResBody> for F
where
    F: Fn(Request<ReqBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<ResBody>> + Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    async fn call(&self, request: Request<ReqBody>) -> Response<ResBody> {
        (self)(request).await
    }
}

/// A handler guarded by a rate limit.
///
/// Denied requests get a 429 without reaching the inner handler. Every
/// response, admitted or not, carries the quota headers.
pub struct RateLimited<H, S: CounterStore + ?Sized> {
    handler: H,
    policy: RateLimitPolicy,
    limiter: Arc<RateLimiter<S>>,
}

impl<H, S: CounterStore + ?Sized> RateLimited<H, S> {
    /// Guard `handler` with `policy`, counting in `store`.
    pub fn new(handler: H, policy: RateLimitPolicy, store: Arc<S>) -> Self {
        Self::with_limiter(handler, policy, Arc::new(RateLimiter::new(store)))
    }

    /// Guard `handler` with `policy` using an existing limiter.
    pub fn with_limiter(handler: H, policy: RateLimitPolicy, limiter: Arc<RateLimiter<S>>) -> Self {
        Self {
            handler,
            policy,
            limiter,
        }
    }

    /// The applied policy.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

#[async_trait]
impl<H, S, ReqBody, ResBody> Handler<ReqBody, ResBody> for RateLimited<H, S>
where
    H: Handler<ReqBody, ResBody>,
    S: CounterStore + ?Sized + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    #[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
    async fn call(&self, request: Request<ReqBody>) -> Response<ResBody> {
        let (parts, body) = request.into_parts();
        let key = self.policy.key_generator.key_for(&parts);

        let decision = self.limiter.check(&key, &self.policy).await;

        if !decision.allowed {
            debug!(key = %key, retry_after = ?decision.retry_after_secs, "Rejecting request");
            return too_many_requests(&decision);
        }

        let mut response = self.handler.call(Request::from_parts(parts, body)).await;
        apply_rate_limit_headers(response.headers_mut(), &decision);
        response
    }
}

/// Guard `handler` with `policy`, counting in `store`.
pub fn wrap<H, S>(handler: H, policy: RateLimitPolicy, store: Arc<S>) -> RateLimited<H, S>
where
    S: CounterStore + ?Sized,
{
    RateLimited::new(handler, policy, store)
}

/// 5 requests per 15 minutes per client address.
pub fn auth_rate_limited<H, S>(handler: H, store: Arc<S>) -> RateLimited<H, S>
where
    S: CounterStore + ?Sized,
{
    preset(handler, "auth", store)
}

/// 100 requests per minute per user.
pub fn api_rate_limited<H, S>(handler: H, store: Arc<S>) -> RateLimited<H, S>
where
    S: CounterStore + ?Sized,
{
    preset(handler, "api", store)
}

/// 20 requests per minute per client address.
pub fn public_rate_limited<H, S>(handler: H, store: Arc<S>) -> RateLimited<H, S>
where
    S: CounterStore + ?Sized,
{
    preset(handler, "public", store)
}

fn preset<H, S>(handler: H, name: &str, store: Arc<S>) -> RateLimited<H, S>
where
    S: CounterStore + ?Sized,
{
    let policy = LimitTable::builtin()
        .policy(name)
        .unwrap_or_else(|| RateLimitPolicy::new(std::time::Duration::from_secs(60), 100));
    RateLimited::new(handler, policy, store)
}
